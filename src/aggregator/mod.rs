//! The authoritative in-memory state of one test run.
//!
//! Protocols live in one arena in arrival order, with an identity index on
//! the side. Every push event is folded in through one of the `apply_*`
//! methods, each of which is idempotent: replaying an event that is already
//! reflected returns [`ApplyOutcome::Unchanged`] and notifies nobody.
//! Everything else (forest, statistics, performance, summaries) is derived
//! on read.

pub mod notify;
pub mod stats;

pub use self::notify::{Change, Listener, Notification, SubscriptionId};
pub use self::stats::RunStatistics;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use self::notify::Listeners;
use crate::model::{
    DeviceId, DeviceStatus, ProtocolEntry, ProtocolId, RunId, RunLogEntry, TestProtocol,
    TestResultState, TestRun,
};
use crate::perf::{startup_deltas, PerformanceView, StartupTime};
use crate::summary::ProtocolSummary;
use crate::tree::{self, ProtocolNode, ResultFilter};

// ---------------------------------------------------------------------------
// Outcomes & policy
// ---------------------------------------------------------------------------

/// Why an event was not applied. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Addressed to a run other than the one held.
    StaleRun,
    UnknownProtocol,
    UnknownDevice,
    /// Would move a finished result back to open.
    RegressedResult,
    /// No snapshot has been applied yet.
    NotSeeded,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnoreReason::StaleRun => "stale run",
            IgnoreReason::UnknownProtocol => "unknown protocol",
            IgnoreReason::UnknownDevice => "unknown device",
            IgnoreReason::RegressedResult => "regressed result",
            IgnoreReason::NotSeeded => "not seeded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Reject updates that would turn a terminal result back into `Open`.
    pub enforce_monotonic_results: bool,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            enforce_monotonic_results: true,
        }
    }
}

impl MergePolicy {
    fn permits(&self, stored: TestResultState, next: TestResultState) -> bool {
        !self.enforce_monotonic_results || stored.can_transition_to(next)
    }
}

// ---------------------------------------------------------------------------
// RunAggregator
// ---------------------------------------------------------------------------

pub struct RunAggregator {
    run: TestRun,
    index: HashMap<ProtocolId, usize>,
    policy: MergePolicy,
    version: u64,
    listeners: Listeners,
}

impl fmt::Debug for RunAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunAggregator")
            .field("run_id", &self.run.id)
            .field("protocols", &self.run.protocols.len())
            .field("version", &self.version)
            .field("policy", &self.policy)
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl RunAggregator {
    pub fn new(run: TestRun, policy: MergePolicy) -> Self {
        let mut aggregator = Self::empty(policy);
        aggregator.seed(run);
        aggregator
    }

    /// An aggregator holding no run yet. Attach listeners, then `seed`, so
    /// they observe the initial snapshot.
    pub fn empty(policy: MergePolicy) -> Self {
        Self {
            run: TestRun::default(),
            index: HashMap::new(),
            policy,
            version: 0,
            listeners: Listeners::default(),
        }
    }

    /// Replace the whole state with a snapshot. Seeding again is a full
    /// resynchronization; listeners stay attached.
    pub fn seed(&mut self, mut run: TestRun) {
        let protocols = std::mem::take(&mut run.protocols);
        self.run = run;
        self.index.clear();
        for mut protocol in protocols {
            for entry in &mut protocol.entries {
                if entry.test_protocol_id == 0 {
                    entry.test_protocol_id = protocol.id;
                }
            }
            match self.index.get(&protocol.id) {
                Some(&i) => self.run.protocols[i] = protocol,
                None => {
                    self.index.insert(protocol.id, self.run.protocols.len());
                    self.run.protocols.push(protocol);
                }
            }
        }
        debug!(
            run_id = self.run.id,
            protocols = self.run.protocols.len(),
            "Seeded run state"
        );
        self.notify(Change::Seeded);
    }

    fn notify(&mut self, change: Change) {
        self.version += 1;
        let notification = Notification {
            run_id: self.run.id,
            version: self.version,
            change,
        };
        self.listeners.emit(&notification);
    }

    fn ignored(&self, reason: IgnoreReason, what: &'static str) -> ApplyOutcome {
        debug!(run_id = self.run.id, %reason, event = what, "Ignoring event");
        ApplyOutcome::Ignored(reason)
    }

    // -- listeners ----------------------------------------------------------

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    // -- mutations ----------------------------------------------------------

    /// Append a line to the run log.
    pub fn apply_log_entry(&mut self, run_id: RunId, mut entry: RunLogEntry) -> ApplyOutcome {
        if run_id != self.run.id {
            return self.ignored(IgnoreReason::StaleRun, "run_log");
        }
        if entry.test_run_id == 0 {
            entry.test_run_id = run_id;
        }
        let duplicate = if entry.id != 0 {
            self.run.log.iter().any(|e| e.id == entry.id)
        } else {
            self.run.log.contains(&entry)
        };
        if duplicate {
            trace!(run_id, entry_id = entry.id, "Run log entry already present");
            return ApplyOutcome::Unchanged;
        }
        self.run.log.push(entry);
        self.notify(Change::RunLogAppended);
        ApplyOutcome::Applied
    }

    /// Insert or replace a protocol by identity. A replaced record keeps its
    /// position in the arena.
    pub fn apply_protocol(&mut self, run_id: RunId, mut protocol: TestProtocol) -> ApplyOutcome {
        if run_id != self.run.id || (protocol.test_run_id != 0 && protocol.test_run_id != run_id)
        {
            return self.ignored(IgnoreReason::StaleRun, "protocol");
        }
        if protocol.test_run_id == 0 {
            protocol.test_run_id = run_id;
        }

        let protocol_id = protocol.id;
        let Some(&i) = self.index.get(&protocol_id) else {
            self.index.insert(protocol_id, self.run.protocols.len());
            self.run.protocols.push(protocol);
            self.notify(Change::ProtocolInserted { protocol_id });
            return ApplyOutcome::Applied;
        };

        let stored = &self.run.protocols[i];
        if !self.policy.permits(stored.test_result, protocol.test_result) {
            return self.ignored(IgnoreReason::RegressedResult, "protocol");
        }

        let merged = merge_protocol(stored, protocol);
        if merged == *stored {
            return ApplyOutcome::Unchanged;
        }
        self.run.protocols[i] = merged;
        self.notify(Change::ProtocolReplaced { protocol_id });
        ApplyOutcome::Applied
    }

    /// Append a line to one protocol's log.
    pub fn apply_protocol_log_entry(
        &mut self,
        protocol_id: ProtocolId,
        mut entry: ProtocolEntry,
    ) -> ApplyOutcome {
        let Some(&i) = self.index.get(&protocol_id) else {
            return self.ignored(IgnoreReason::UnknownProtocol, "protocol_log");
        };
        if entry.test_protocol_id == 0 {
            entry.test_protocol_id = protocol_id;
        }

        let entries = &mut self.run.protocols[i].entries;
        let duplicate = if entry.id != 0 {
            entries.iter().any(|e| e.id == entry.id)
        } else {
            entries.contains(&entry)
        };
        if duplicate {
            trace!(protocol_id, entry_id = entry.id, "Protocol entry already present");
            return ApplyOutcome::Unchanged;
        }
        entries.push(entry);
        self.notify(Change::ProtocolLogAppended { protocol_id });
        ApplyOutcome::Applied
    }

    /// Flip the status code of `device_id` on the run's device record and on
    /// every embedded reference. A device that protocols only name by id
    /// gets a run-level record to hold the code.
    pub fn apply_device_status(&mut self, device_id: DeviceId, status: i64) -> ApplyOutcome {
        let mut matched = 0usize;
        let mut changed = 0usize;
        let mut flip = |code: &mut i64| {
            matched += 1;
            if *code != status {
                *code = status;
                changed += 1;
            }
        };

        for record in &mut self.run.device_status {
            if record.device_id == device_id {
                flip(&mut record.status);
            }
            if let Some(device) = record.device.as_mut().filter(|d| d.id == device_id) {
                flip(&mut device.status);
            }
        }
        let mut referenced_by_id = false;
        for protocol in &mut self.run.protocols {
            referenced_by_id |= protocol.device_id == Some(device_id);
            if let Some(device) = protocol.device.as_mut().filter(|d| d.id == device_id) {
                flip(&mut device.status);
            }
        }

        let has_record = self
            .run
            .device_status
            .iter()
            .any(|record| record.device_id == device_id);
        if referenced_by_id && !has_record {
            self.run.device_status.push(DeviceStatus {
                device_id,
                status,
                ..Default::default()
            });
            matched += 1;
            changed += 1;
        }

        if matched == 0 {
            return self.ignored(IgnoreReason::UnknownDevice, "device_status");
        }
        if changed == 0 {
            return ApplyOutcome::Unchanged;
        }
        self.notify(Change::DeviceStatusChanged { device_id, status });
        ApplyOutcome::Applied
    }

    pub fn apply_run_finished(&mut self, run_id: RunId, result: TestResultState) -> ApplyOutcome {
        if run_id != self.run.id {
            return self.ignored(IgnoreReason::StaleRun, "run_finished");
        }
        if !self.policy.permits(self.run.test_result, result) {
            return self.ignored(IgnoreReason::RegressedResult, "run_finished");
        }
        if self.run.test_result == result {
            return ApplyOutcome::Unchanged;
        }
        self.run.test_result = result;
        self.notify(Change::RunFinished { result });
        ApplyOutcome::Applied
    }

    // -- reads --------------------------------------------------------------

    pub fn run(&self) -> &TestRun {
        &self.run
    }

    pub fn run_id(&self) -> RunId {
        self.run.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn protocols(&self) -> &[TestProtocol] {
        &self.run.protocols
    }

    pub fn protocol(&self, id: ProtocolId) -> Option<&TestProtocol> {
        self.index.get(&id).map(|&i| &self.run.protocols[i])
    }

    pub fn protocol_forest(&self) -> Vec<ProtocolNode> {
        tree::build_forest(&self.run.protocols)
    }

    pub fn filtered_forest(&self, filter: &ResultFilter) -> Vec<ProtocolNode> {
        tree::filter_forest(self.protocol_forest(), filter)
    }

    /// Stored protocols the forest cannot reach yet.
    pub fn orphans(&self) -> Vec<ProtocolId> {
        tree::orphans(&self.run.protocols)
    }

    pub fn statistics(&self) -> RunStatistics {
        RunStatistics::from_protocols(&self.run.protocols)
    }

    pub fn performance_view(&self, protocol_id: ProtocolId) -> Option<PerformanceView> {
        self.protocol(protocol_id).map(PerformanceView::for_protocol)
    }

    pub fn protocol_summary(&self, protocol_id: ProtocolId) -> Option<ProtocolSummary> {
        self.protocol(protocol_id)
            .map(|p| ProtocolSummary::from_entries(&p.entries))
    }

    pub fn startup_times(&self) -> Vec<StartupTime> {
        startup_deltas(&self.run.device_status)
    }
}

/// Combine a stored protocol with an incoming record for the same identity.
///
/// The incoming record wins field by field, except where it carries less
/// than what is already held: log lines that arrived on the protocol's own
/// log topic, history and baseline data that only the full snapshot
/// carries, and the embedded device reference.
fn merge_protocol(stored: &TestProtocol, mut incoming: TestProtocol) -> TestProtocol {
    for entry in &mut incoming.entries {
        if entry.test_protocol_id == 0 {
            entry.test_protocol_id = incoming.id;
        }
    }
    incoming.entries = merge_entries(&stored.entries, std::mem::take(&mut incoming.entries));

    if incoming.performance.is_empty() {
        incoming.performance = stored.performance.clone();
    }
    if incoming.history.is_empty() {
        incoming.history = stored.history.clone();
    }
    if incoming.averages.is_empty() {
        incoming.averages = stored.averages;
    }
    if incoming.historical.is_empty() {
        incoming.historical = stored.historical;
    }
    if incoming.device.is_none() && incoming.device_id == stored.device_id {
        incoming.device = stored.device.clone();
    }
    incoming
}

/// The log stays in the order it was first seen. Held lines take the
/// incoming content for the same identity; lines new to the log follow.
fn merge_entries(held: &[ProtocolEntry], incoming: Vec<ProtocolEntry>) -> Vec<ProtocolEntry> {
    let same = |a: &ProtocolEntry, b: &ProtocolEntry| {
        if a.id != 0 {
            a.id == b.id
        } else {
            a == b
        }
    };
    let mut merged = held.to_vec();
    for entry in incoming {
        match merged.iter_mut().find(|e| same(&**e, &entry)) {
            Some(slot) => *slot = entry,
            None => merged.push(entry),
        }
    }
    merged
}
