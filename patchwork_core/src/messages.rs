//! Wire protocol between nodes.
//!
//! Every cross-node effect travels as a [`PatchMessage`] serialized into an
//! [`Envelope`] payload.

use crate::atom::{CompAtom, ForceResults, FullAtom};
use crate::compute::ComputeId;
use crate::error::{PatchError, PatchResult};
use crate::patch::PatchId;
use crate::spanning_tree::SpanningTree;
use patchwork_env::{Envelope, NodeId};
use serde::{Deserialize, Serialize};

/// Atoms handed from one home patch to a neighbor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateAtoms {
    pub source: PatchId,
    pub dest: PatchId,
    /// Direction from `source` toward `dest`
    pub direction: u8,
    pub step: u64,
    pub atoms: Vec<FullAtom>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchMessage {
    /// Proxy node -> home node
    RegisterProxy { patch: PatchId, node: NodeId },

    /// Proxy node -> home node
    UnregisterProxy { patch: PatchId, node: NodeId },

    /// Home node -> every proxy node
    SpanningTree { tree: SpanningTree },

    /// Proxy node -> home node
    SpanningTreeAck {
        patch: PatchId,
        node: NodeId,
        version: u64,
    },

    /// Down the spanning tree
    ProxyData {
        patch: PatchId,
        step: u64,
        tree_version: u64,
        positions: Vec<CompAtom>,
    },

    /// Proxy node -> home node
    ProxyResults {
        patch: PatchId,
        step: u64,
        node: NodeId,
        forces: ForceResults,
    },

    /// Home node -> neighbor's home node
    MigrateAtoms(MigrateAtoms),

    /// Source node -> destination node during relocation
    InstantiateCompute { cid: ComputeId },

    /// Destination node -> source node during relocation
    ComputeInstantiated { cid: ComputeId, node: NodeId },
}

impl PatchMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PatchMessage::RegisterProxy { .. } => "register-proxy",
            PatchMessage::UnregisterProxy { .. } => "unregister-proxy",
            PatchMessage::SpanningTree { .. } => "spanning-tree",
            PatchMessage::SpanningTreeAck { .. } => "spanning-tree-ack",
            PatchMessage::ProxyData { .. } => "proxy-data",
            PatchMessage::ProxyResults { .. } => "proxy-results",
            PatchMessage::MigrateAtoms(_) => "migrate-atoms",
            PatchMessage::InstantiateCompute { .. } => "instantiate-compute",
            PatchMessage::ComputeInstantiated { .. } => "compute-instantiated",
        }
    }

    pub fn encode(&self, step: u64) -> PatchResult<Envelope> {
        let payload = serde_json::to_vec(self).map_err(|e| PatchError::Codec(e.to_string()))?;
        Ok(Envelope::new(payload, step))
    }

    pub fn decode(envelope: &Envelope) -> PatchResult<Self> {
        serde_json::from_slice(&envelope.payload).map_err(|e| PatchError::Codec(e.to_string()))
    }
}

/// Messages a node wants delivered, in order.
pub type Outbox = Vec<(NodeId, PatchMessage)>;
