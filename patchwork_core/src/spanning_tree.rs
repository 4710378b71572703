//! Broadcast tree over the nodes holding proxies of one home patch.
//!
//! The home node is the root. Proxies on the home's host hang directly under
//! the root. Every other host contributes one host root (its lowest node),
//! and host roots form a k-ary tree under the home. Remaining proxies on a
//! host hang under their host root, so each host receives the data once
//! over the wire.

use crate::error::{PatchError, PatchResult};
use crate::patch::PatchId;
use crate::topology::Topology;
use patchwork_env::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One node and its direct children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub node: NodeId,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanningTree {
    pub patch: PatchId,
    pub root: NodeId,
    pub version: u64,
    /// Root first, then breadth-first
    pub nodes: Vec<TreeNode>,
}

impl SpanningTree {
    /// Tree with no proxies.
    pub fn empty(patch: PatchId, root: NodeId) -> Self {
        Self {
            patch,
            root,
            version: 0,
            nodes: vec![TreeNode {
                node: root,
                children: Vec::new(),
            }],
        }
    }

    /// Builds the node-aware tree for `proxies`. The root is skipped if it
    /// appears in the set.
    pub fn build(
        patch: PatchId,
        root: NodeId,
        proxies: &BTreeSet<NodeId>,
        topology: &Topology,
        branching: usize,
        version: u64,
    ) -> Self {
        let branching = branching.max(1);
        let home_host = topology.host_of(root);
        let groups = topology.group_by_host(proxies.iter().copied().filter(|n| *n != root));

        let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut host_roots = Vec::new();

        for (host, members) in &groups {
            if *host == home_host {
                children.entry(root).or_default().extend(members.iter().copied());
                continue;
            }
            let (first, rest) = match members.split_first() {
                Some(split) => split,
                None => continue,
            };
            host_roots.push(*first);
            children.entry(*first).or_default().extend(rest.iter().copied());
        }

        // Heap layout over [root, host_roots...]: parent of slot j is (j - 1) / k.
        for (i, host_root) in host_roots.iter().enumerate() {
            let slot = i + 1;
            let parent_slot = (slot - 1) / branching;
            let parent = if parent_slot == 0 {
                root
            } else {
                host_roots[parent_slot - 1]
            };
            children.entry(parent).or_default().push(*host_root);
        }

        let mut nodes = Vec::with_capacity(proxies.len() + 1);
        let mut queue = std::collections::VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            let kids = children.remove(&node).unwrap_or_default();
            queue.extend(kids.iter().copied());
            nodes.push(TreeNode { node, children: kids });
        }

        Self {
            patch,
            root,
            version,
            nodes,
        }
    }

    /// Direct children of `node` (empty for leaves and unknown nodes).
    pub fn children_of(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .iter()
            .find(|t| t.node == node)
            .map(|t| t.children.as_slice())
            .unwrap_or(&[])
    }

    /// Every non-root node.
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .map(|t| t.node)
            .filter(|n| *n != self.root)
            .collect()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.iter().any(|t| t.node == node)
    }

    /// Longest root-to-leaf path, in edges.
    pub fn depth(&self) -> usize {
        fn walk(tree: &SpanningTree, node: NodeId, guard: usize) -> usize {
            if guard == 0 {
                return 0;
            }
            tree.children_of(node)
                .iter()
                .map(|c| 1 + walk(tree, *c, guard - 1))
                .max()
                .unwrap_or(0)
        }
        walk(self, self.root, self.nodes.len())
    }

    /// Checks that the tree reaches exactly `expected` (plus the root), each
    /// node once, with no cycles and no unreachable entries.
    pub fn validate(&self, expected: &BTreeSet<NodeId>) -> PatchResult<()> {
        let malformed = |reason: String| PatchError::MalformedTree {
            patch: self.patch,
            reason,
        };

        let mut seen = BTreeSet::from([self.root]);
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            for child in self.children_of(node) {
                if !seen.insert(*child) {
                    return Err(malformed(format!("{child} reached twice")));
                }
                stack.push(*child);
            }
        }

        for entry in &self.nodes {
            if !seen.contains(&entry.node) {
                return Err(malformed(format!("{} is not reachable from the root", entry.node)));
            }
        }

        seen.remove(&self.root);
        let wanted: BTreeSet<NodeId> = expected.iter().copied().filter(|n| *n != self.root).collect();
        if seen != wanted {
            let missing: Vec<_> = wanted.difference(&seen).collect();
            let extra: Vec<_> = seen.difference(&wanted).collect();
            return Err(malformed(format!("missing {missing:?}, unexpected {extra:?}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwork_env::HostId;
    use proptest::prelude::*;

    #[test]
    fn test_same_host_proxies_hang_under_root() {
        let topo = Topology::uniform(2, 4);
        let proxies = BTreeSet::from([NodeId(1), NodeId(2), NodeId(5), NodeId(6)]);
        let tree = SpanningTree::build(PatchId(0), NodeId(0), &proxies, &topo, 4, 1);

        assert_eq!(tree.children_of(NodeId(0)), &[NodeId(1), NodeId(2), NodeId(5)]);
        assert_eq!(tree.children_of(NodeId(5)), &[NodeId(6)]);
        assert!(tree.validate(&proxies).is_ok());
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_host_roots_form_kary_tree() {
        // One node per host, so every proxy is a host root.
        let topo = Topology::new((0..8).map(HostId).collect());
        let proxies: BTreeSet<NodeId> = (1..8).map(NodeId).collect();
        let tree = SpanningTree::build(PatchId(2), NodeId(0), &proxies, &topo, 2, 3);

        assert_eq!(tree.children_of(NodeId(0)), &[NodeId(1), NodeId(2)]);
        assert_eq!(tree.children_of(NodeId(1)), &[NodeId(3), NodeId(4)]);
        assert_eq!(tree.children_of(NodeId(3)), &[NodeId(7)]);
        assert_eq!(tree.version, 3);
        assert!(tree.validate(&proxies).is_ok());
    }

    #[test]
    fn test_validate_rejects_cycle_and_orphan() {
        let mut tree = SpanningTree::empty(PatchId(1), NodeId(0));
        tree.nodes[0].children.push(NodeId(1));
        tree.nodes.push(TreeNode {
            node: NodeId(1),
            children: vec![NodeId(0)],
        });
        assert!(matches!(
            tree.validate(&BTreeSet::from([NodeId(1)])),
            Err(PatchError::MalformedTree { .. })
        ));

        let mut orphan = SpanningTree::empty(PatchId(1), NodeId(0));
        orphan.nodes.push(TreeNode {
            node: NodeId(4),
            children: vec![],
        });
        assert!(orphan.validate(&BTreeSet::new()).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_proxy() {
        let topo = Topology::uniform(1, 4);
        let tree = SpanningTree::build(PatchId(0), NodeId(0), &BTreeSet::from([NodeId(1)]), &topo, 4, 1);
        assert!(tree.validate(&BTreeSet::from([NodeId(1), NodeId(2)])).is_err());
    }

    proptest! {
        #[test]
        fn prop_tree_covers_every_proxy_once(
            hosts in 1u32..6,
            per_host in 1u32..5,
            root_seed in 0u32..100,
            picks in proptest::collection::vec(any::<bool>(), 30),
            branching in 1usize..5,
        ) {
            let topo = Topology::uniform(hosts, per_host);
            let n = topo.num_nodes() as u32;
            let root = NodeId(root_seed % n);
            let proxies: BTreeSet<NodeId> = (0..n)
                .filter(|i| picks[*i as usize % picks.len()])
                .map(NodeId)
                .filter(|node| *node != root)
                .collect();

            let tree = SpanningTree::build(PatchId(7), root, &proxies, &topo, branching, 1);
            prop_assert!(tree.validate(&proxies).is_ok());
            prop_assert_eq!(tree.members(), proxies.clone());
            prop_assert_eq!(tree.nodes.len(), proxies.len() + 1);
        }
    }
}
