//! The viewing session: which run is active, its aggregator, and notices.
//!
//! At most one run is active. Switching runs drops the old aggregator at
//! once and bumps a generation counter; a snapshot fetch started before
//! the switch carries the old generation in its [`FetchTicket`] and is
//! discarded when it completes.

pub mod apply_loop;
pub mod notice;

pub use self::apply_loop::{refresh_protocol, run_apply_loop, LoopSummary, SharedSession};
pub use self::notice::{Notice, NoticeBoard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{ApplyOutcome, IgnoreReason, Listener, MergePolicy, RunAggregator};
use crate::config::RunscopeConfig;
use crate::events::{PushEvent, Topic};
use crate::model::RunId;
use crate::snapshot::{ProtocolSnapshot, RunSnapshot, SnapshotError};

/// Captured when a snapshot fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub run_id: RunId,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Seeded,
    /// The session moved on while the fetch was in flight.
    Stale,
    Failed,
}

/// Adjacent runs of the same test, as reported by the run snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbours {
    pub next_run_id: Option<RunId>,
    pub prev_run_id: Option<RunId>,
}

pub struct RunSession {
    policy: MergePolicy,
    notice_ttl: Duration,
    active: Option<RunId>,
    generation: u64,
    aggregator: Option<RunAggregator>,
    neighbours: Neighbours,
    notices: NoticeBoard,
    /// Attached to every aggregator this session creates.
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for RunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSession")
            .field("active", &self.active)
            .field("generation", &self.generation)
            .field("aggregator", &self.aggregator)
            .field("neighbours", &self.neighbours)
            .finish()
    }
}

impl RunSession {
    pub fn new(policy: MergePolicy, notice_ttl: Duration) -> Self {
        Self {
            policy,
            notice_ttl,
            active: None,
            generation: 0,
            aggregator: None,
            neighbours: Neighbours::default(),
            notices: NoticeBoard::default(),
            listeners: Vec::new(),
        }
    }

    pub fn from_config(config: &RunscopeConfig) -> Self {
        Self::new(config.merge_policy(), config.session.notice_ttl())
    }

    /// Make `run_id` the active run. Any previous aggregator is dropped.
    pub fn switch_run(&mut self, run_id: RunId) -> FetchTicket {
        self.generation += 1;
        if let Some(previous) = self.active.replace(run_id) {
            debug!(from = previous, to = run_id, "Switching run");
        }
        self.aggregator = None;
        self.neighbours = Neighbours::default();
        FetchTicket {
            run_id,
            generation: self.generation,
        }
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation && self.active == Some(ticket.run_id)
    }

    /// Finish a snapshot fetch started with `ticket`.
    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<RunSnapshot, SnapshotError>,
        now: DateTime<Utc>,
    ) -> FetchOutcome {
        if !self.is_current(&ticket) {
            debug!(
                run_id = ticket.run_id,
                generation = ticket.generation,
                current = self.generation,
                "Discarding stale snapshot"
            );
            return FetchOutcome::Stale;
        }

        match result {
            Ok(snapshot) => {
                let mut aggregator = RunAggregator::empty(self.policy);
                for listener in &self.listeners {
                    aggregator.subscribe(listener.clone());
                }
                aggregator.seed(snapshot.run);
                info!(
                    run_id = ticket.run_id,
                    protocols = aggregator.protocols().len(),
                    "Run seeded"
                );
                self.neighbours = Neighbours {
                    next_run_id: snapshot.next_run_id,
                    prev_run_id: snapshot.prev_run_id,
                };
                self.aggregator = Some(aggregator);
                FetchOutcome::Seeded
            }
            Err(e) => {
                warn!(run_id = ticket.run_id, error = %e, "Snapshot fetch failed");
                self.notices.post(Notice::new(
                    format!("Could not load test run {}: {}", ticket.run_id, e),
                    now,
                    self.notice_ttl,
                ));
                FetchOutcome::Failed
            }
        }
    }

    /// Route a decoded push event to the aggregator.
    pub fn dispatch(&mut self, event: PushEvent) -> ApplyOutcome {
        let Some(aggregator) = self.aggregator.as_mut() else {
            debug!(topic = %event.topic(), "Discarding event before seed");
            return ApplyOutcome::Ignored(IgnoreReason::NotSeeded);
        };
        match event {
            PushEvent::RunLog { run_id, entry } => aggregator.apply_log_entry(run_id, entry),
            PushEvent::Protocol { run_id, protocol } => aggregator.apply_protocol(run_id, protocol),
            PushEvent::ProtocolLog { protocol_id, entry } => {
                aggregator.apply_protocol_log_entry(protocol_id, entry)
            }
            PushEvent::RunFinished { run_id, result } => {
                aggregator.apply_run_finished(run_id, result)
            }
            PushEvent::DeviceStatus { device_id, status } => {
                aggregator.apply_device_status(device_id, status)
            }
        }
    }

    /// Upsert every record of a protocol snapshot into the active run.
    pub fn merge_protocol_snapshot(&mut self, snapshot: ProtocolSnapshot) -> Vec<ApplyOutcome> {
        let Some(run_id) = self.active else {
            return vec![ApplyOutcome::Ignored(IgnoreReason::NotSeeded); snapshot.protocols.len()];
        };
        snapshot
            .protocols
            .into_iter()
            .map(|protocol| self.dispatch(PushEvent::Protocol { run_id, protocol }))
            .collect()
    }

    /// Topics to subscribe to for the active run.
    pub fn topics(&self) -> Vec<Topic> {
        let Some(run_id) = self.active else {
            return Vec::new();
        };
        let mut topics = vec![
            Topic::RunLog(run_id),
            Topic::RunProtocol(run_id),
            Topic::RunFinished(run_id),
            Topic::Devices,
        ];
        if let Some(aggregator) = &self.aggregator {
            topics.extend(aggregator.protocols().iter().map(|p| Topic::ProtocolLog(p.id)));
        }
        topics
    }

    /// Attach a listener to the current aggregator and to every later one.
    pub fn on_change(&mut self, listener: Listener) {
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.subscribe(listener.clone());
        }
        self.listeners.push(listener);
    }

    // -- notices ------------------------------------------------------------

    pub fn notices(&self, now: DateTime<Utc>) -> Vec<Notice> {
        self.notices.active(now)
    }

    pub fn dismiss_notice(&mut self, id: Uuid) -> bool {
        self.notices.dismiss(id)
    }

    pub fn prune_notices(&mut self, now: DateTime<Utc>) -> usize {
        self.notices.prune(now)
    }

    // -- reads --------------------------------------------------------------

    pub fn active_run(&self) -> Option<RunId> {
        self.active
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn aggregator(&self) -> Option<&RunAggregator> {
        self.aggregator.as_ref()
    }

    pub fn neighbours(&self) -> Neighbours {
        self.neighbours
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Change;
    use crate::model::{TestProtocol, TestResultState, TestRun};

    fn session() -> RunSession {
        RunSession::new(MergePolicy::default(), Duration::seconds(5))
    }

    fn snapshot(run_id: RunId, protocol_ids: &[u64]) -> RunSnapshot {
        RunSnapshot {
            run: TestRun {
                id: run_id,
                protocols: protocol_ids
                    .iter()
                    .map(|&id| TestProtocol {
                        id,
                        test_run_id: run_id,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            next_run_id: Some(run_id + 1),
            prev_run_id: None,
        }
    }

    #[test]
    fn test_events_before_seed_are_discarded() {
        let mut s = session();
        s.switch_run(1);
        let outcome = s.dispatch(PushEvent::RunFinished {
            run_id: 1,
            result: TestResultState::Success,
        });
        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::NotSeeded));
    }

    #[test]
    fn test_stale_fetch_after_switch() {
        let mut s = session();
        let first = s.switch_run(1);
        let second = s.switch_run(2);

        assert_eq!(
            s.complete_fetch(first, Ok(snapshot(1, &[10])), Utc::now()),
            FetchOutcome::Stale
        );
        assert!(s.aggregator().is_none());

        assert_eq!(
            s.complete_fetch(second, Ok(snapshot(2, &[20])), Utc::now()),
            FetchOutcome::Seeded
        );
        assert_eq!(s.aggregator().unwrap().run_id(), 2);
        assert_eq!(s.neighbours().next_run_id, Some(3));
    }

    #[test]
    fn test_refetching_same_run_is_stale_after_switch_back() {
        let mut s = session();
        let first = s.switch_run(1);
        s.switch_run(2);
        s.switch_run(1);
        assert_eq!(
            s.complete_fetch(first, Ok(snapshot(1, &[])), Utc::now()),
            FetchOutcome::Stale
        );
    }

    #[test]
    fn test_failed_fetch_posts_notice() {
        let mut s = session();
        let ticket = s.switch_run(4);
        let now = Utc::now();
        let outcome = s.complete_fetch(
            ticket,
            Err(SnapshotError::NotFound("run 4".to_string())),
            now,
        );
        assert_eq!(outcome, FetchOutcome::Failed);
        assert!(s.aggregator().is_none());

        let notices = s.notices(now);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.contains("run 4"));
        assert!(s.notices(now + Duration::seconds(5)).is_empty());

        assert!(s.dismiss_notice(notices[0].id));
        assert!(s.notices(now).is_empty());
    }

    #[test]
    fn test_topics_follow_known_protocols() {
        let mut s = session();
        assert!(s.topics().is_empty());

        let ticket = s.switch_run(3);
        s.complete_fetch(ticket, Ok(snapshot(3, &[30, 31])), Utc::now());
        let names: Vec<String> = s.topics().iter().map(Topic::to_string).collect();
        assert_eq!(
            names,
            vec![
                "test_run_3_log",
                "test_run_3_protocol",
                "test_run_3_finished",
                "devices",
                "test_protocol_30_log",
                "test_protocol_31_log",
            ]
        );
    }

    #[test]
    fn test_switch_drops_aggregator() {
        let mut s = session();
        let ticket = s.switch_run(1);
        s.complete_fetch(ticket, Ok(snapshot(1, &[10])), Utc::now());
        assert!(s.aggregator().is_some());

        s.switch_run(2);
        assert!(s.aggregator().is_none());
        assert_eq!(s.active_run(), Some(2));
        assert_eq!(s.neighbours(), Neighbours::default());
    }

    #[test]
    fn test_listeners_survive_reseed() {
        use std::sync::{Arc, Mutex};

        let mut s = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.on_change(Arc::new(move |n: &crate::aggregator::Notification| {
            sink.lock().unwrap().push((n.run_id, n.change.clone()))
        }));

        for run_id in [1, 2] {
            let ticket = s.switch_run(run_id);
            s.complete_fetch(ticket, Ok(snapshot(run_id, &[])), Utc::now());
            s.dispatch(PushEvent::RunFinished {
                run_id,
                result: TestResultState::Success,
            });
        }
        let seen = seen.lock().unwrap();
        let runs: Vec<RunId> = seen.iter().map(|(run_id, _)| *run_id).collect();
        assert_eq!(runs, vec![1, 1, 2, 2]);
        assert_eq!(seen[0].1, Change::Seeded);
        assert_eq!(seen[2].1, Change::Seeded);
    }

    #[test]
    fn test_protocol_snapshot_merges_history() {
        let mut s = session();
        let ticket = s.switch_run(1);
        s.complete_fetch(ticket, Ok(snapshot(1, &[10])), Utc::now());

        let detailed = TestProtocol {
            id: 10,
            test_run_id: 1,
            history: vec![TestProtocol {
                id: 5,
                ..Default::default()
            }],
            ..Default::default()
        };
        let outcomes = s.merge_protocol_snapshot(ProtocolSnapshot {
            protocols: vec![detailed],
        });
        assert_eq!(outcomes, vec![ApplyOutcome::Applied]);
        let stored = s.aggregator().unwrap().protocol(10).unwrap();
        assert_eq!(stored.history.len(), 1);
    }
}
