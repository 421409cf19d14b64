//! Checkpoint execution times and run-over-run performance deltas.
//!
//! The comparator owns the "is higher better" policy for every metric so
//! that consumers only decide how to draw an `Improved` or `Regressed`
//! trend, never which one it is.

pub mod startup;

pub use self::startup::{startup_deltas, StartupTime};

use serde::Serialize;

use crate::model::{AggregateMetrics, PerformanceSample, ProtocolId, TestProtocol};

pub use crate::model::protocol::SCHEDULE_CHECKPOINT;

/// Number of prior executions overlaid on a protocol's charts.
pub const HISTORY_WINDOW: usize = 2;

// ---------------------------------------------------------------------------
// Execution times
// ---------------------------------------------------------------------------

/// Drop `schedule` samples and derive each sample's execution time.
///
/// Array order is the temporal order. The first sample's execution time is
/// its own runtime; every later one is its runtime minus the previous kept
/// sample's runtime.
pub fn compute_execution_times(samples: &[PerformanceSample]) -> Vec<PerformanceSample> {
    let mut previous: Option<f64> = None;
    samples
        .iter()
        .filter(|s| !s.is_schedule())
        .map(|s| {
            let mut s = s.clone();
            s.execution_time = match previous {
                Some(prev) => s.runtime - prev,
                None => s.runtime,
            };
            previous = Some(s.runtime);
            s
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Baseline deltas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Fps,
    Mem,
    Cpu,
    VertexCount,
    Triangles,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Fps,
        Metric::Mem,
        Metric::Cpu,
        Metric::VertexCount,
        Metric::Triangles,
    ];

    /// Only frame rate improves when it goes up.
    pub fn higher_is_better(self) -> bool {
        matches!(self, Metric::Fps)
    }

    fn read(self, m: &AggregateMetrics) -> f64 {
        match self {
            Metric::Fps => m.fps,
            Metric::Mem => m.mem,
            Metric::Cpu => m.cpu,
            Metric::VertexCount => m.vertex_count,
            Metric::Triangles => m.triangles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improved,
    Regressed,
    Unchanged,
}

impl Trend {
    pub fn classify(delta: f64, higher_is_better: bool) -> Self {
        if delta == 0.0 || delta.is_nan() {
            Trend::Unchanged
        } else if (delta > 0.0) == higher_is_better {
            Trend::Improved
        } else {
            Trend::Regressed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDelta {
    pub metric: Metric,
    pub current: f64,
    pub baseline: f64,
    pub delta: f64,
    pub higher_is_better: bool,
    pub trend: Trend,
}

impl MetricDelta {
    fn new(metric: Metric, current: &AggregateMetrics, baseline: &AggregateMetrics) -> Self {
        let current = metric.read(current);
        let baseline = metric.read(baseline);
        let delta = current - baseline;
        let higher_is_better = metric.higher_is_better();
        Self {
            metric,
            current,
            baseline,
            delta,
            higher_is_better,
            trend: Trend::classify(delta, higher_is_better),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMetrics {
    pub fps: MetricDelta,
    pub mem: MetricDelta,
    pub cpu: MetricDelta,
    pub vertex_count: MetricDelta,
    pub triangles: MetricDelta,
}

impl DeltaMetrics {
    pub fn iter(&self) -> impl Iterator<Item = &MetricDelta> {
        [
            &self.fps,
            &self.mem,
            &self.cpu,
            &self.vertex_count,
            &self.triangles,
        ]
        .into_iter()
    }

    pub fn regressions(&self) -> Vec<Metric> {
        self.iter()
            .filter(|d| d.trend == Trend::Regressed)
            .map(|d| d.metric)
            .collect()
    }
}

/// `current - baseline` for every metric.
pub fn compare_to_baseline(current: &AggregateMetrics, baseline: &AggregateMetrics) -> DeltaMetrics {
    DeltaMetrics {
        fps: MetricDelta::new(Metric::Fps, current, baseline),
        mem: MetricDelta::new(Metric::Mem, current, baseline),
        cpu: MetricDelta::new(Metric::Cpu, current, baseline),
        vertex_count: MetricDelta::new(Metric::VertexCount, current, baseline),
        triangles: MetricDelta::new(Metric::Triangles, current, baseline),
    }
}

// ---------------------------------------------------------------------------
// History window
// ---------------------------------------------------------------------------

/// The last [`HISTORY_WINDOW`] prior executions, in their original order,
/// with samples run through [`compute_execution_times`].
pub fn select_history_window(history: &[TestProtocol]) -> Vec<TestProtocol> {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .map(|p| {
            let mut p = p.clone();
            p.performance = compute_execution_times(&p.performance);
            p
        })
        .collect()
}

// ---------------------------------------------------------------------------
// PerformanceView
// ---------------------------------------------------------------------------

/// Everything a protocol's performance tab needs, derived in one go.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceView {
    pub protocol_id: ProtocolId,
    pub checkpoints: Vec<PerformanceSample>,
    pub history: Vec<TestProtocol>,
    pub averages: AggregateMetrics,
    pub historical: AggregateMetrics,
    pub deltas: DeltaMetrics,
}

impl PerformanceView {
    pub fn for_protocol(protocol: &TestProtocol) -> Self {
        let checkpoints = compute_execution_times(&protocol.performance);
        // Push records may arrive without the hub's precomputed averages.
        let averages = if protocol.averages.is_empty() {
            AggregateMetrics::mean_of(&protocol.performance)
        } else {
            protocol.averages
        };

        Self {
            protocol_id: protocol.id,
            checkpoints,
            history: select_history_window(&protocol.history),
            averages,
            historical: protocol.historical,
            deltas: compare_to_baseline(&averages, &protocol.historical),
        }
    }
}
