//! Run, protocol, and device records as delivered by the hub.
//!
//! Everything here is plain data. The only logic is the result-state
//! transition rule and a few display helpers used by the derived views.

pub mod device;
pub mod protocol;
pub mod run;

pub use self::device::{AppBinaryRef, DeviceRef, DeviceStatus};
pub use self::protocol::{
    AggregateMetrics, EntrySource, LogLevel, PerformanceSample, ProtocolEntry, TestProtocol,
};
pub use self::run::{RunLogEntry, TestRun};

use serde::{Deserialize, Serialize};

pub type RunId = u64;
pub type ProtocolId = u64;
pub type DeviceId = u64;

/// Result state shared by runs and protocols.
///
/// `Open` is the only non-terminal state. Once a record reaches a terminal
/// state it may move to another terminal state (a retried run turning from
/// `Failed` into `Success`), but never back to `Open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResultState {
    #[default]
    Open,
    Failed,
    Success,
    Unstable,
}

impl TestResultState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Whether a stored state may be overwritten by `next`.
    pub fn can_transition_to(self, next: TestResultState) -> bool {
        !(self.is_terminal() && next == Self::Open)
    }
}

impl std::fmt::Display for TestResultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestResultState::Open => write!(f, "open"),
            TestResultState::Failed => write!(f, "failed"),
            TestResultState::Success => write!(f, "success"),
            TestResultState::Unstable => write!(f, "unstable"),
        }
    }
}
