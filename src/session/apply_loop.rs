//! The serialized apply loop: seed from a snapshot, then fold push events in
//! one at a time.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FetchOutcome, RunSession};
use crate::aggregator::ApplyOutcome;
use crate::events::{self, EventSource, Topic};
use crate::model::{ProtocolId, RunId};
use crate::snapshot::{SnapshotError, SnapshotLoader};

pub type SharedSession = Arc<RwLock<RunSession>>;

/// Counters for one apply loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub fetch: FetchOutcome,
    pub applied: usize,
    pub unchanged: usize,
    pub ignored: usize,
    pub malformed: usize,
}

impl LoopSummary {
    fn new(fetch: FetchOutcome) -> Self {
        Self {
            fetch,
            applied: 0,
            unchanged: 0,
            ignored: 0,
            malformed: 0,
        }
    }

    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
            ApplyOutcome::Ignored(_) => self.ignored += 1,
        }
    }
}

/// Subscribe to whatever the session wants that is not subscribed yet.
async fn sync_subscriptions<S>(
    session: &SharedSession,
    source: &mut S,
    subscribed: &mut HashSet<Topic>,
) where
    S: EventSource + ?Sized,
{
    let wanted = session.read().await.topics();
    for topic in wanted {
        if !subscribed.contains(&topic) {
            source.subscribe(&topic).await;
            subscribed.insert(topic);
        }
    }
}

/// Make `run_id` the session's active run and keep it up to date from
/// `source` until the source closes, `shutdown` fires, or another run is
/// switched in.
///
/// Events are applied strictly one after another; the session lock is held
/// only for the synchronous apply.
pub async fn run_apply_loop<S>(
    session: SharedSession,
    run_id: RunId,
    loader: Arc<dyn SnapshotLoader>,
    source: &mut S,
    shutdown: CancellationToken,
) -> LoopSummary
where
    S: EventSource + ?Sized,
{
    let ticket = session.write().await.switch_run(run_id);
    info!(run_id, generation = ticket.generation, "Loading run snapshot");

    let result = tokio::select! {
        _ = shutdown.cancelled() => {
            debug!(run_id, "Shutdown during snapshot fetch");
            return LoopSummary::new(FetchOutcome::Stale);
        }
        result = loader.load_run(run_id) => result,
    };

    let fetch = session
        .write()
        .await
        .complete_fetch(ticket, result, Utc::now());
    let mut summary = LoopSummary::new(fetch);
    if fetch != FetchOutcome::Seeded {
        return summary;
    }

    let mut subscribed = HashSet::new();
    sync_subscriptions(&session, source, &mut subscribed).await;
    debug!(run_id, topics = subscribed.len(), "Subscribed to run topics");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(run_id, "Apply loop shutting down");
                break;
            }
            message = source.next_message() => message,
        };
        let Some(raw) = message else {
            debug!(run_id, "Event source closed");
            break;
        };

        let event = match events::decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                summary.malformed += 1;
                warn!(topic = %raw.topic, error = %e, "Dropping malformed push message");
                continue;
            }
        };
        let adds_protocol = matches!(event, events::PushEvent::Protocol { .. });

        let outcome = {
            let mut guard = session.write().await;
            guard.is_current(&ticket).then(|| guard.dispatch(event))
        };
        let Some(outcome) = outcome else {
            debug!(run_id, "Run switched away, stopping apply loop");
            break;
        };
        summary.record(outcome);
        if adds_protocol && outcome.is_applied() {
            sync_subscriptions(&session, source, &mut subscribed).await;
        }
    }

    for topic in &subscribed {
        source.unsubscribe(topic).await;
    }

    info!(
        run_id,
        applied = summary.applied,
        unchanged = summary.unchanged,
        ignored = summary.ignored,
        malformed = summary.malformed,
        "Apply loop finished"
    );
    summary
}

/// Fetch the detailed record of one protocol (including its history) and
/// merge it into the active run. Returns the number of records applied.
pub async fn refresh_protocol(
    session: &SharedSession,
    loader: &dyn SnapshotLoader,
    protocol_id: ProtocolId,
) -> Result<usize, SnapshotError> {
    let (run_id, generation) = {
        let guard = session.read().await;
        match (guard.active_run(), guard.aggregator()) {
            (Some(run_id), Some(_)) => (run_id, guard.generation()),
            _ => return Err(SnapshotError::NotFound("seeded run".to_string())),
        }
    };

    let snapshot = loader.load_protocol(run_id, protocol_id).await?;

    let mut guard = session.write().await;
    if guard.generation() != generation {
        debug!(run_id, protocol_id, "Discarding protocol snapshot for switched run");
        return Ok(0);
    }
    let applied = guard
        .merge_protocol_snapshot(snapshot)
        .into_iter()
        .filter(|o| o.is_applied())
        .count();
    debug!(run_id, protocol_id, applied, "Merged protocol snapshot");
    Ok(applied)
}
