//! Simulated message transport.
//!
//! Every node's outgoing envelopes go to one central router channel, which
//! the world drains into per-node inboxes. A single router keeps delivery in
//! send order for every (sender, receiver) pair.

use async_trait::async_trait;
use patchwork_env::{EnvError, Envelope, MessageTransport, NodeId};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, Mutex};

/// Simulated network interface for a node.
pub struct SimNetwork {
    /// This node's ID
    local_id: NodeId,

    /// Sender to central router
    tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Receiver for incoming envelopes (behind tokio mutex for async)
    rx: Mutex<mpsc::UnboundedReceiver<(NodeId, Envelope)>>,
}

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub envelope: Envelope,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: NodeId,
        tx: mpsc::UnboundedSender<NetworkMessage>,
        rx: mpsc::UnboundedReceiver<(NodeId, Envelope)>,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl MessageTransport for SimNetwork {
    async fn send(&self, target: NodeId, envelope: Envelope) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            to: target,
            envelope,
        };

        self.tx
            .send(msg)
            .map_err(|_| EnvError::network("router channel closed"))
    }

    async fn recv(&self) -> Option<(NodeId, Envelope)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<(NodeId, Envelope)> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    fn local_id(&self) -> NodeId {
        self.local_id
    }
}

/// Traffic counters, per message kind.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub messages: u64,
    pub bytes: u64,
    pub by_kind: BTreeMap<&'static str, u64>,
}

impl NetworkStats {
    pub fn record(&mut self, kind: &'static str, bytes: usize) {
        self.messages += 1;
        self.bytes += bytes as u64;
        *self.by_kind.entry(kind).or_default() += 1;
    }

    pub fn count(&self, kind: &str) -> u64 {
        self.by_kind.get(kind).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_goes_through_router() {
        let (router_tx, mut router_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let net = SimNetwork::new(NodeId(3), router_tx, inbox_rx);

        net.send(NodeId(1), Envelope::new(vec![7], 2)).await.unwrap();
        let routed = router_rx.try_recv().unwrap();
        assert_eq!(routed.from, NodeId(3));
        assert_eq!(routed.to, NodeId(1));

        assert!(net.try_recv().is_none());
        inbox_tx.send((NodeId(1), Envelope::new(vec![8], 2))).unwrap();
        let (from, env) = net.try_recv().unwrap();
        assert_eq!(from, NodeId(1));
        assert_eq!(env.payload, vec![8]);
    }

    #[tokio::test]
    async fn test_send_after_router_closed() {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (_inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let net = SimNetwork::new(NodeId(0), router_tx, inbox_rx);
        drop(router_rx);
        assert!(net.send(NodeId(1), Envelope::new(vec![], 0)).await.is_err());
    }

    #[test]
    fn test_stats_by_kind() {
        let mut stats = NetworkStats::default();
        stats.record("proxy-data", 100);
        stats.record("proxy-data", 50);
        stats.record("migrate-atoms", 10);
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.bytes, 160);
        assert_eq!(stats.count("proxy-data"), 2);
        assert_eq!(stats.count("spanning-tree"), 0);
    }
}
