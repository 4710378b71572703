//! Message transport abstraction between Patchwork nodes.

use crate::error::EnvError;
use crate::types::{Envelope, NodeId};
use async_trait::async_trait;

/// Abstraction for message I/O between nodes.
///
/// # Guarantees
///
/// Implementations must deliver every accepted envelope exactly once and in
/// send order for each (sender, receiver) pair. The patch protocol relies on
/// this and has no retry logic of its own.
///
/// ```text
/// Node A                    Transport                  Node B
///   |                           |                          |
///   |-- send(B, envelope) ----->|                          |
///   |                           |------------------------->|
///   |                           |                          |-- recv() -> envelope
/// ```
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Queues an envelope for delivery to `target`.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope accepted
    /// * `Err(EnvError::NetworkError)` - The transport is shut down
    async fn send(&self, target: NodeId, envelope: Envelope) -> Result<(), EnvError>;

    /// Receives the next envelope addressed to this node.
    ///
    /// Returns `None` once the transport is closed.
    async fn recv(&self) -> Option<(NodeId, Envelope)>;

    /// Returns the next envelope if one is already queued.
    fn try_recv(&self) -> Option<(NodeId, Envelope)>;

    /// Returns this node's ID.
    fn local_id(&self) -> NodeId;
}
