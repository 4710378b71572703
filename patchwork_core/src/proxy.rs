//! Proxies: read-only replicas of remote home patches.
//!
//! A proxy exposes the same boxes as its home patch so computes on this
//! node can run against it. Forces deposited into a proxy are shipped back
//! to the home once every local contributor has closed.

use crate::atom::{CompAtom, ForceResults};
use crate::error::{PatchError, PatchResult};
use crate::messages::{Outbox, PatchMessage};
use crate::patch::{Patch, PatchExtents, PatchId};
use crate::spanning_tree::SpanningTree;
use patchwork_env::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct ProxyPatch {
    patch: Patch,
    home: NodeId,
    tree: Option<SpanningTree>,
    last_step: Option<u64>,
    results_sent: bool,
}

impl ProxyPatch {
    pub fn new(id: PatchId, home: NodeId, extents: PatchExtents) -> Self {
        Self {
            patch: Patch::new(id, extents),
            home,
            tree: None,
            last_step: None,
            results_sent: true,
        }
    }

    pub fn id(&self) -> PatchId {
        self.patch.id()
    }

    pub fn home(&self) -> NodeId {
        self.home
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn patch_mut(&mut self) -> &mut Patch {
        &mut self.patch
    }

    pub fn tree_version(&self) -> Option<u64> {
        self.tree.as_ref().map(|t| t.version)
    }

    pub fn last_step(&self) -> Option<u64> {
        self.last_step
    }

    /// Whether results for the latest publication have gone home.
    pub fn is_settled(&self) -> bool {
        self.results_sent
    }

    fn receive_tree(&mut self, tree: SpanningTree) {
        self.tree = Some(tree);
    }

    fn receive_data(&mut self, step: u64, tree_version: u64, positions: Vec<CompAtom>) -> PatchResult<()> {
        let known = self.tree_version();
        if known != Some(tree_version) {
            return Err(PatchError::StaleSpanningTree {
                patch: self.id(),
                expected: known.unwrap_or(0),
                got: tree_version,
            });
        }
        self.patch.publish(step, Arc::new(positions))?;
        self.last_step = Some(step);
        self.results_sent = false;
        Ok(())
    }

    fn take_results(&mut self) -> PatchResult<Option<ForceResults>> {
        if self.results_sent || !self.patch.forces_done() {
            return Ok(None);
        }
        self.results_sent = true;
        self.patch.take_forces().map(Some)
    }
}

/// Per-node owner of proxies.
#[derive(Debug)]
pub struct ProxyMgr {
    node: NodeId,
    proxies: BTreeMap<PatchId, ProxyPatch>,
}

impl ProxyMgr {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            proxies: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn contains(&self, patch: PatchId) -> bool {
        self.proxies.contains_key(&patch)
    }

    pub fn get(&self, patch: PatchId) -> Option<&ProxyPatch> {
        self.proxies.get(&patch)
    }

    pub fn get_mut(&mut self, patch: PatchId) -> Option<&mut ProxyPatch> {
        self.proxies.get_mut(&patch)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyPatch> {
        self.proxies.values()
    }

    /// Creates a proxy for `patch` if none exists. Returns the registration
    /// message for the home when one was created.
    pub fn ensure_proxy(&mut self, patch: PatchId, home: NodeId, extents: PatchExtents) -> Option<(NodeId, PatchMessage)> {
        if self.proxies.contains_key(&patch) {
            return None;
        }
        debug!(node = %self.node, %patch, %home, "creating proxy");
        self.proxies.insert(patch, ProxyPatch::new(patch, home, extents));
        Some((
            home,
            PatchMessage::RegisterProxy {
                patch,
                node: self.node,
            },
        ))
    }

    /// Destroys the proxy for `patch` and returns the unregistration
    /// message. The proxy must have no box users left.
    pub fn release_proxy(&mut self, patch: PatchId) -> PatchResult<(NodeId, PatchMessage)> {
        let proxy = self.proxies.get(&patch).ok_or(PatchError::LostProxy {
            patch,
            node: self.node,
        })?;
        if proxy.patch.num_position_users() > 0 || proxy.patch.num_force_users() > 0 {
            return Err(PatchError::InvalidState {
                patch,
                state: "in use".to_string(),
                op: "release proxy",
            });
        }
        let home = proxy.home;
        self.proxies.remove(&patch);
        debug!(node = %self.node, %patch, %home, "releasing proxy");
        Ok((
            home,
            PatchMessage::UnregisterProxy {
                patch,
                node: self.node,
            },
        ))
    }

    /// Installs a new spanning tree and returns the acknowledgement.
    pub fn receive_tree(&mut self, tree: SpanningTree) -> PatchResult<(NodeId, PatchMessage)> {
        let patch = tree.patch;
        let proxy = self.proxies.get_mut(&patch).ok_or(PatchError::LostProxy {
            patch,
            node: self.node,
        })?;
        let version = tree.version;
        proxy.receive_tree(tree);
        Ok((
            proxy.home,
            PatchMessage::SpanningTreeAck {
                patch,
                node: self.node,
                version,
            },
        ))
    }

    /// Publishes positions into the proxy and forwards them to this node's
    /// children in the spanning tree.
    pub fn receive_positions(
        &mut self,
        patch: PatchId,
        step: u64,
        tree_version: u64,
        positions: Vec<CompAtom>,
    ) -> PatchResult<Outbox> {
        let node = self.node;
        let proxy = self
            .proxies
            .get_mut(&patch)
            .ok_or(PatchError::LostProxy { patch, node })?;

        let forward = positions.clone();
        proxy.receive_data(step, tree_version, positions)?;

        let children = proxy
            .tree
            .as_ref()
            .map(|t| t.children_of(node).to_vec())
            .unwrap_or_default();
        Ok(children
            .into_iter()
            .map(|child| {
                (
                    child,
                    PatchMessage::ProxyData {
                        patch,
                        step,
                        tree_version,
                        positions: forward.clone(),
                    },
                )
            })
            .collect())
    }

    /// Results for every proxy whose force box has all-closed since its
    /// last publication.
    pub fn collect_results(&mut self) -> PatchResult<Outbox> {
        let mut out = Vec::new();
        for proxy in self.proxies.values_mut() {
            if let Some(forces) = proxy.take_results()? {
                let step = proxy.last_step.unwrap_or_default();
                out.push((
                    proxy.home,
                    PatchMessage::ProxyResults {
                        patch: proxy.id(),
                        step,
                        node: self.node,
                        forces,
                    },
                ));
            }
        }
        Ok(out)
    }

    /// Whether every proxy published for `step` has sent its results.
    pub fn settled_for(&self, step: u64) -> bool {
        self.proxies
            .values()
            .all(|p| p.last_step == Some(step) && p.results_sent)
    }
}
