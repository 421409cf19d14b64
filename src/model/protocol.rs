//! Test protocols: one record per test function executed on one device.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{DeviceId, DeviceRef, ProtocolId, RunId, TestResultState};

/// Checkpoint label the hub emits while a protocol is waiting for a device.
/// It carries no execution time of its own.
pub const SCHEDULE_CHECKPOINT: &str = "schedule";

// ---------------------------------------------------------------------------
// TestProtocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestProtocol {
    pub id: ProtocolId,
    #[serde(default)]
    pub test_run_id: RunId,
    /// Absent or zero for a root execution.
    #[serde(default)]
    pub parent_test_protocol_id: Option<ProtocolId>,
    #[serde(default)]
    pub test_name: String,
    /// Absent when scheduling on a device failed.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub device: Option<DeviceRef>,
    #[serde(default)]
    pub test_result: TestResultState,
    #[serde(default)]
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<ProtocolEntry>,
    #[serde(default)]
    pub performance: Vec<PerformanceSample>,
    /// Running averages over this protocol's samples.
    #[serde(default)]
    pub averages: AggregateMetrics,
    /// The same averages from the previous comparable run.
    #[serde(default)]
    pub historical: AggregateMetrics,
    /// Prior executions of the same test on the same device, oldest first.
    #[serde(default)]
    pub history: Vec<TestProtocol>,
}

impl TestProtocol {
    /// Parent reference with the hub's "zero means none" convention folded in.
    pub fn parent_id(&self) -> Option<ProtocolId> {
        self.parent_test_protocol_id.filter(|id| *id != 0)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id().is_none()
    }

    /// Wall-clock duration, `None` while the protocol is still running.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Last `/`-separated segment of the test name.
    pub fn display_name(&self) -> &str {
        self.test_name
            .rsplit('/')
            .next()
            .unwrap_or(self.test_name.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProtocolEntry
// ---------------------------------------------------------------------------

/// Where a protocol log line originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    App,
    Step,
    Device,
    Status,
    Testrunner,
    Action,
    Screen,
}

/// Severity of a log line. Unrecognised levels read as `Info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl From<String> for LogLevel {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" | "fatal" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl From<LogLevel> for String {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
        .to_string()
    }
}

/// One immutable line in a protocol's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolEntry {
    /// Zero when the hub did not assign an identity.
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub test_protocol_id: ProtocolId,
    pub source: EntrySource,
    #[serde(default)]
    pub level: LogLevel,
    /// Empty when the payload is carried by `data` alone.
    #[serde(default)]
    pub message: String,
    /// Opaque handle, e.g. a screenshot reference.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    #[serde(default)]
    pub test_protocol_id: ProtocolId,
    pub checkpoint: String,
    /// Seconds since the protocol started, cumulative.
    #[serde(default)]
    pub runtime: f64,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub vertex_count: u64,
    #[serde(default)]
    pub triangles: u64,
    /// Derived: runtime minus the previous sample's runtime.
    #[serde(default)]
    pub execution_time: f64,
}

impl PerformanceSample {
    pub fn is_schedule(&self) -> bool {
        self.checkpoint == SCHEDULE_CHECKPOINT
    }
}

/// Averaged metrics for one protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateMetrics {
    pub fps: f64,
    pub mem: f64,
    pub cpu: f64,
    pub vertex_count: f64,
    pub triangles: f64,
}

impl AggregateMetrics {
    pub fn is_empty(&self) -> bool {
        *self == AggregateMetrics::default()
    }

    /// Mean over all non-schedule samples. All zero when there are none.
    pub fn mean_of(samples: &[PerformanceSample]) -> Self {
        let measured: Vec<&PerformanceSample> =
            samples.iter().filter(|s| !s.is_schedule()).collect();
        if measured.is_empty() {
            return Self::default();
        }

        let n = measured.len() as f64;
        let mut sum = Self::default();
        for s in &measured {
            sum.fps += s.fps;
            sum.mem += s.mem;
            sum.cpu += s.cpu;
            sum.vertex_count += s.vertex_count as f64;
            sum.triangles += s.triangles as f64;
        }

        Self {
            fps: sum.fps / n,
            mem: sum.mem / n,
            cpu: sum.cpu / n,
            vertex_count: sum.vertex_count / n,
            triangles: sum.triangles / n,
        }
    }
}
