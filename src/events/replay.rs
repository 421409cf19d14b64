//! Replays a recorded push stream: one raw message (`{topic, payload}`) per
//! line. Blank lines are skipped, unparsable lines are logged and skipped.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{trace, warn};

use super::source::{EventSource, Subscriptions};
use super::{RawMessage, Topic};

pub struct ReplayEventSource<R = BufReader<File>> {
    lines: Lines<R>,
    line_no: usize,
    skipped: usize,
    subscriptions: Subscriptions,
}

impl ReplayEventSource<BufReader<File>> {
    pub async fn open(path: &Path) -> Result<Self, super::EventError> {
        let file = File::open(path).await?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R> ReplayEventSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            skipped: 0,
            subscriptions: Subscriptions::default(),
        }
    }

    /// Lines that could not be parsed as a raw message.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[async_trait::async_trait]
impl<R> EventSource for ReplayEventSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn subscribe(&mut self, topic: &Topic) {
        self.subscriptions.add(topic);
    }

    async fn unsubscribe(&mut self, topic: &Topic) {
        self.subscriptions.remove(topic);
    }

    async fn next_message(&mut self) -> Option<RawMessage> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(line = self.line_no + 1, error = %e, "Replay stream read failed");
                    return None;
                }
            };
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message: RawMessage = match serde_json::from_str(line) {
                Ok(m) => m,
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "Skipping unparsable replay line");
                    continue;
                }
            };

            if self.subscriptions.accepts(&message.topic) {
                return Some(message);
            }
            trace!(line = self.line_no, topic = %message.topic, "Replay topic not subscribed");
        }
    }
}
