//! Common types for the Patchwork environment abstraction.

use serde::{Deserialize, Serialize};

/// Identifier of an addressable node (one process in the layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Returns the raw index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Identifier of a physical host. Several nodes may share one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host{}", self.0)
    }
}

/// Envelope for messages transmitted between nodes.
///
/// This is a transport-layer wrapper - the payload is opaque bytes that the
/// receiving runtime decodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The encoded message
    pub payload: Vec<u8>,

    /// Timestep the sender was working on
    pub step: u64,
}

impl Envelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(payload: Vec<u8>, step: u64) -> Self {
        Self { payload, step }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_size() {
        let env = Envelope::new(vec![1, 2, 3], 7);
        assert_eq!(env.step, 7);
        assert_eq!(env.size(), 3);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(3).to_string(), "node3");
        assert_eq!(HostId(1).to_string(), "host1");
    }
}
