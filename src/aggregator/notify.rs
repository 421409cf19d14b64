//! Change notifications and listener bookkeeping.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::model::{DeviceId, ProtocolId, RunId, TestResultState};

/// What a successful mutation changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Seeded,
    RunLogAppended,
    ProtocolInserted { protocol_id: ProtocolId },
    ProtocolReplaced { protocol_id: ProtocolId },
    ProtocolLogAppended { protocol_id: ProtocolId },
    DeviceStatusChanged { device_id: DeviceId, status: i64 },
    RunFinished { result: TestResultState },
}

/// Delivered to every listener after a mutation. `version` strictly
/// increases over the life of one aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub run_id: RunId,
    pub version: u64,
    pub change: Change,
}

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, Listener)>,
}

impl Listeners {
    pub(crate) fn add(&mut self, listener: Listener) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(sid, _)| *sid != id);
        self.entries.len() != before
    }

    /// Subscription order.
    pub(crate) fn emit(&self, notification: &Notification) {
        for (_, listener) in &self.entries {
            listener(notification);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
