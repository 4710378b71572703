//! Node/process layout: which host each addressable node runs on.

use patchwork_env::{HostId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Physical layout supplied by the setup phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    host_of: Vec<HostId>,
}

impl Topology {
    /// Layout from an explicit node -> host table (index = node id).
    pub fn new(host_of: Vec<HostId>) -> Self {
        Self { host_of }
    }

    /// `hosts` hosts with `nodes_per_host` nodes each, numbered host-major.
    pub fn uniform(hosts: u32, nodes_per_host: u32) -> Self {
        let host_of = (0..hosts)
            .flat_map(|h| std::iter::repeat(HostId(h)).take(nodes_per_host as usize))
            .collect();
        Self { host_of }
    }

    pub fn num_nodes(&self) -> usize {
        self.host_of.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.host_of.len() as u32).map(NodeId)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.host_of.len()
    }

    /// Host of `node`. Unknown nodes are treated as living alone on a host
    /// numbered past the known ones.
    pub fn host_of(&self, node: NodeId) -> HostId {
        self.host_of
            .get(node.index())
            .copied()
            .unwrap_or(HostId(u32::MAX - node.0))
    }

    /// Groups `nodes` by host, each group sorted by node id.
    pub fn group_by_host(&self, nodes: impl IntoIterator<Item = NodeId>) -> BTreeMap<HostId, Vec<NodeId>> {
        let mut groups: BTreeMap<HostId, Vec<NodeId>> = BTreeMap::new();
        for node in nodes {
            groups.entry(self.host_of(node)).or_default().push(node);
        }
        for group in groups.values_mut() {
            group.sort();
            group.dedup();
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout() {
        let topo = Topology::uniform(2, 3);
        assert_eq!(topo.num_nodes(), 6);
        assert_eq!(topo.host_of(NodeId(0)), HostId(0));
        assert_eq!(topo.host_of(NodeId(2)), HostId(0));
        assert_eq!(topo.host_of(NodeId(3)), HostId(1));
    }

    #[test]
    fn test_group_by_host() {
        let topo = Topology::uniform(2, 2);
        let groups = topo.group_by_host([NodeId(3), NodeId(0), NodeId(2), NodeId(3)]);
        assert_eq!(groups[&HostId(0)], vec![NodeId(0)]);
        assert_eq!(groups[&HostId(1)], vec![NodeId(2), NodeId(3)]);
    }
}
