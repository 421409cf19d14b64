//! Parent/child protocol forest.
//!
//! Protocols are stored flat and reference their parent by identity. The
//! forest is a derived view rebuilt from scratch on every call; nothing
//! here patches a previous tree.

pub mod filter;

pub use self::filter::{filter_forest, ResultFilter};

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::model::{ProtocolId, TestProtocol};

/// A protocol with its resolved children.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolNode {
    #[serde(flatten)]
    pub protocol: TestProtocol,
    pub children: Vec<ProtocolNode>,
}

impl ProtocolNode {
    pub fn id(&self) -> ProtocolId {
        self.protocol.id
    }

    /// Number of nodes in this subtree, including the node itself.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(ProtocolNode::size).sum::<usize>()
    }
}

/// Index links between protocols: root positions and per-position children.
struct Links {
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
}

fn link(protocols: &[TestProtocol]) -> Links {
    // First occurrence of an identity wins; later duplicates are ignored.
    let mut index: HashMap<ProtocolId, usize> = HashMap::with_capacity(protocols.len());
    for (i, p) in protocols.iter().enumerate() {
        index.entry(p.id).or_insert(i);
    }

    let mut roots = Vec::new();
    let mut children = vec![Vec::new(); protocols.len()];

    for (i, p) in protocols.iter().enumerate() {
        if index.get(&p.id) != Some(&i) {
            continue;
        }
        match p.parent_id() {
            None => roots.push(i),
            Some(parent) => {
                if let Some(&pi) = index.get(&parent) {
                    if pi != i {
                        children[pi].push(i);
                    }
                }
            }
        }
    }

    Links { roots, children }
}

fn assemble(i: usize, protocols: &[TestProtocol], children: &[Vec<usize>]) -> ProtocolNode {
    ProtocolNode {
        protocol: protocols[i].clone(),
        children: children[i]
            .iter()
            .map(|&c| assemble(c, protocols, children))
            .collect(),
    }
}

/// Build the forest of root protocols.
///
/// Records whose parent is not present (not streamed yet, or part of a
/// parent cycle) are left out until a later rebuild can resolve them.
/// Children keep the order they have in `protocols`.
pub fn build_forest(protocols: &[TestProtocol]) -> Vec<ProtocolNode> {
    let links = link(protocols);
    links
        .roots
        .iter()
        .map(|&r| assemble(r, protocols, &links.children))
        .collect()
}

/// Identities that `build_forest` currently leaves out.
pub fn orphans(protocols: &[TestProtocol]) -> Vec<ProtocolId> {
    let links = link(protocols);
    let mut reachable = HashSet::new();
    let mut stack = links.roots.clone();
    while let Some(i) = stack.pop() {
        reachable.insert(protocols[i].id);
        stack.extend(links.children[i].iter().copied());
    }

    let mut seen = HashSet::new();
    protocols
        .iter()
        .map(|p| p.id)
        .filter(|id| !reachable.contains(id) && seen.insert(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(id: ProtocolId, parent: Option<ProtocolId>) -> TestProtocol {
        TestProtocol {
            id,
            test_run_id: 1,
            parent_test_protocol_id: parent,
            test_name: format!("Suite/Test{}", id),
            ..Default::default()
        }
    }

    fn ids(nodes: &[ProtocolNode]) -> Vec<ProtocolId> {
        nodes.iter().map(ProtocolNode::id).collect()
    }

    #[test]
    fn test_roots_and_children() {
        let list = vec![
            protocol(1, None),
            protocol(2, Some(1)),
            protocol(3, Some(0)),
            protocol(4, Some(1)),
        ];
        let forest = build_forest(&list);
        assert_eq!(ids(&forest), vec![1, 3]);
        assert_eq!(ids(&forest[0].children), vec![2, 4]);
        assert!(forest[1].children.is_empty());
    }

    #[test]
    fn test_child_before_parent_is_attached() {
        let list = vec![protocol(2, Some(1)), protocol(1, None)];
        let forest = build_forest(&list);
        assert_eq!(ids(&forest), vec![1]);
        assert_eq!(ids(&forest[0].children), vec![2]);
    }

    #[test]
    fn test_orphan_is_invisible() {
        let list = vec![protocol(1, None), protocol(5, Some(99))];
        let forest = build_forest(&list);
        assert_eq!(ids(&forest), vec![1]);
        assert_eq!(forest[0].size(), 1);
        assert_eq!(orphans(&list), vec![5]);
    }

    #[test]
    fn test_nested_levels() {
        let list = vec![
            protocol(1, None),
            protocol(2, Some(1)),
            protocol(3, Some(2)),
        ];
        let forest = build_forest(&list);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].size(), 3);
        assert_eq!(ids(&forest[0].children[0].children), vec![3]);
    }

    #[test]
    fn test_parent_cycle_and_self_reference_are_dropped() {
        let list = vec![
            protocol(1, Some(2)),
            protocol(2, Some(1)),
            protocol(3, Some(3)),
            protocol(4, None),
        ];
        let forest = build_forest(&list);
        assert_eq!(ids(&forest), vec![4]);
        assert_eq!(orphans(&list), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_identity_keeps_first() {
        let mut dup = protocol(1, None);
        dup.test_name = "Suite/Later".to_string();
        let list = vec![protocol(1, None), dup];
        let forest = build_forest(&list);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].protocol.test_name, "Suite/Test1");
        assert!(orphans(&list).is_empty());
    }
}
