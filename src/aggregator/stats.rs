//! Pass/fail/pending counters over a run's protocols.

use serde::Serialize;

use crate::model::{TestProtocol, TestResultState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub open: usize,
    pub failed: usize,
    pub success: usize,
    pub unstable: usize,
    pub total: usize,
}

impl RunStatistics {
    /// Count every stored protocol, including ones not yet attached to the
    /// forest.
    pub fn from_protocols(protocols: &[TestProtocol]) -> Self {
        let mut stats = Self::default();
        for p in protocols {
            stats.record(p.test_result);
        }
        stats
    }

    fn record(&mut self, state: TestResultState) {
        match state {
            TestResultState::Open => self.open += 1,
            TestResultState::Failed => self.failed += 1,
            TestResultState::Success => self.success += 1,
            TestResultState::Unstable => self.unstable += 1,
        }
        self.total += 1;
    }

    /// Every protocol has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.open == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_result(id: u64, test_result: TestResultState) -> TestProtocol {
        TestProtocol {
            id,
            test_result,
            ..Default::default()
        }
    }

    #[test]
    fn test_counts_by_state() {
        let stats = RunStatistics::from_protocols(&[
            with_result(1, TestResultState::Open),
            with_result(2, TestResultState::Success),
            with_result(3, TestResultState::Unstable),
            with_result(4, TestResultState::Success),
        ]);
        assert_eq!(
            stats,
            RunStatistics {
                open: 1,
                failed: 0,
                success: 2,
                unstable: 1,
                total: 4
            }
        );
        assert!(!stats.is_settled());
    }

    #[test]
    fn test_empty_run() {
        let stats = RunStatistics::from_protocols(&[]);
        assert_eq!(stats.total, 0);
        assert!(stats.is_settled());
    }
}
