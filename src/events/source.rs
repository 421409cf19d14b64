//! The push-channel contract and the in-process channel implementation.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{EventError, RawMessage, Topic};

/// A topic-addressed push channel.
///
/// Messages on one topic arrive in publish order; there is no ordering
/// across topics. Messages on topics the consumer has not subscribed to are
/// dropped by the source.
#[async_trait::async_trait]
pub trait EventSource: Send {
    async fn subscribe(&mut self, topic: &Topic);

    async fn unsubscribe(&mut self, topic: &Topic);

    /// The next message on a subscribed topic, or `None` once the source
    /// is exhausted or closed.
    async fn next_message(&mut self) -> Option<RawMessage>;
}

/// Topic names a source currently delivers.
#[derive(Debug, Default, Clone)]
pub(crate) struct Subscriptions {
    topics: HashSet<String>,
}

impl Subscriptions {
    pub(crate) fn add(&mut self, topic: &Topic) -> bool {
        self.topics.insert(topic.to_string())
    }

    pub(crate) fn remove(&mut self, topic: &Topic) -> bool {
        self.topics.remove(&topic.to_string())
    }

    pub(crate) fn accepts(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub(crate) fn len(&self) -> usize {
        self.topics.len()
    }
}

/// Create a bounded in-process channel. The publisher half is cloneable and
/// is what the HTTP ingest endpoint writes into.
pub fn channel(buffer: usize) -> (EventPublisher, ChannelEventSource) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        EventPublisher { tx },
        ChannelEventSource {
            rx,
            subscriptions: Subscriptions::default(),
        },
    )
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<RawMessage>,
}

impl EventPublisher {
    /// Queue a message, waiting for capacity.
    pub async fn publish(&self, message: RawMessage) -> Result<(), EventError> {
        self.tx.send(message).await.map_err(|_| EventError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct ChannelEventSource {
    rx: mpsc::Receiver<RawMessage>,
    subscriptions: Subscriptions,
}

#[async_trait::async_trait]
impl EventSource for ChannelEventSource {
    async fn subscribe(&mut self, topic: &Topic) {
        if self.subscriptions.add(topic) {
            debug!(topic = %topic, total = self.subscriptions.len(), "Subscribed");
        }
    }

    async fn unsubscribe(&mut self, topic: &Topic) {
        if self.subscriptions.remove(topic) {
            debug!(topic = %topic, total = self.subscriptions.len(), "Unsubscribed");
        }
    }

    async fn next_message(&mut self) -> Option<RawMessage> {
        while let Some(message) = self.rx.recv().await {
            if self.subscriptions.accepts(&message.topic) {
                return Some(message);
            }
            trace!(topic = %message.topic, "Dropping message on unsubscribed topic");
        }
        None
    }
}
