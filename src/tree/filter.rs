//! Result-state filter for the protocol forest.

use serde::{Deserialize, Serialize};

use super::ProtocolNode;
use crate::model::TestResultState;

/// Which result states are visible. `Unstable` protocols are shown together
/// with failed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultFilter {
    pub success: bool,
    pub failed: bool,
    pub pending: bool,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            success: true,
            failed: true,
            pending: true,
        }
    }
}

impl ResultFilter {
    pub fn matches(&self, state: TestResultState) -> bool {
        match state {
            TestResultState::Success => self.success,
            TestResultState::Failed | TestResultState::Unstable => self.failed,
            TestResultState::Open => self.pending,
        }
    }

    pub fn is_everything(&self) -> bool {
        self.success && self.failed && self.pending
    }
}

/// Prune the forest to matching protocols.
///
/// A node stays if it matches or if any of its descendants does, so a
/// failed retry stays reachable under a successful parent.
pub fn filter_forest(nodes: Vec<ProtocolNode>, filter: &ResultFilter) -> Vec<ProtocolNode> {
    if filter.is_everything() {
        return nodes;
    }
    nodes
        .into_iter()
        .filter_map(|node| prune(node, filter))
        .collect()
}

fn prune(mut node: ProtocolNode, filter: &ResultFilter) -> Option<ProtocolNode> {
    let children = std::mem::take(&mut node.children);
    node.children = filter_forest(children, filter);
    if filter.matches(node.protocol.test_result) || !node.children.is_empty() {
        Some(node)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestProtocol;
    use crate::tree::build_forest;

    fn protocol(id: u64, parent: Option<u64>, result: TestResultState) -> TestProtocol {
        TestProtocol {
            id,
            parent_test_protocol_id: parent,
            test_result: result,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_filter_keeps_everything() {
        let forest = build_forest(&[
            protocol(1, None, TestResultState::Open),
            protocol(2, None, TestResultState::Failed),
        ]);
        assert_eq!(filter_forest(forest.clone(), &ResultFilter::default()), forest);
    }

    #[test]
    fn test_unstable_counts_as_failed() {
        let only_failed = ResultFilter {
            success: false,
            failed: true,
            pending: false,
        };
        assert!(only_failed.matches(TestResultState::Unstable));
        assert!(!only_failed.matches(TestResultState::Open));
    }

    #[test]
    fn test_parent_kept_for_matching_child() {
        let forest = build_forest(&[
            protocol(1, None, TestResultState::Success),
            protocol(2, Some(1), TestResultState::Failed),
            protocol(3, Some(1), TestResultState::Success),
            protocol(4, None, TestResultState::Success),
        ]);
        let filter = ResultFilter {
            success: false,
            failed: true,
            pending: false,
        };
        let filtered = filter_forest(forest, &filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id(), 1);
        assert_eq!(filtered[0].children.len(), 1);
        assert_eq!(filtered[0].children[0].id(), 2);
    }

    #[test]
    fn test_nothing_selected_hides_all() {
        let forest = build_forest(&[protocol(1, None, TestResultState::Open)]);
        let none = ResultFilter {
            success: false,
            failed: false,
            pending: false,
        };
        assert!(filter_forest(forest, &none).is_empty());
    }
}
