//! Message transport contract and an in-process implementation.
//!
//! The real bus (peer discovery, delivery) lives outside this crate; the mesh
//! only needs to publish frames, send a frame to one node, receive frames for
//! this node and know which peers are currently live.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    clock::NodeId,
    error::{TransportError, TransportResult},
};

/// Opaque payload on a named topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity this transport delivers for
    fn local_node(&self) -> &NodeId;

    /// Deliver to every live peer. Having no peers is not an error.
    async fn publish(&self, frame: Frame) -> TransportResult<()>;

    /// Deliver to a single peer
    async fn send(&self, to: &NodeId, frame: Frame) -> TransportResult<()>;

    /// Take the inbound frame stream for this node. Can only be taken once.
    fn subscribe(&self) -> TransportResult<mpsc::UnboundedReceiver<Frame>>;

    /// Peers currently believed reachable, excluding this node
    fn live_peers(&self) -> Vec<NodeId>;
}

// ============================================================================
// LocalBus - In-Process Transport Hub
// ============================================================================

#[derive(Debug)]
struct Endpoint {
    inbox: mpsc::UnboundedSender<Frame>,
    reachable: bool,
}

/// In-process bus connecting any number of nodes.
///
/// Reachability can be toggled per node to simulate partitions: an unreachable
/// node neither sends nor receives.
#[derive(Debug, Default)]
pub struct LocalBus {
    endpoints: DashMap<NodeId, Endpoint>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node, replacing any previous endpoint with the same id
    pub fn join(self: &Arc<Self>, node_id: NodeId) -> LocalTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(
            node_id.clone(),
            Endpoint {
                inbox: tx,
                reachable: true,
            },
        );
        debug!(node = %node_id, "Node joined local bus");
        LocalTransport {
            bus: Arc::clone(self),
            node_id,
            inbox: Mutex::new(Some(rx)),
        }
    }

    pub fn leave(&self, node_id: &NodeId) {
        self.endpoints.remove(node_id);
        debug!(node = %node_id, "Node left local bus");
    }

    pub fn set_reachable(&self, node_id: &NodeId, reachable: bool) {
        if let Some(mut endpoint) = self.endpoints.get_mut(node_id) {
            endpoint.reachable = reachable;
        }
    }

    fn is_reachable(&self, node_id: &NodeId) -> bool {
        self.endpoints
            .get(node_id)
            .is_some_and(|endpoint| endpoint.reachable)
    }

    fn peers_of(&self, node_id: &NodeId) -> Vec<NodeId> {
        if !self.is_reachable(node_id) {
            return Vec::new();
        }
        let mut peers: Vec<NodeId> = self
            .endpoints
            .iter()
            .filter(|entry| entry.key() != node_id && entry.value().reachable)
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, frame: Frame) -> TransportResult<()> {
        if !self.is_reachable(from) {
            return Err(TransportError::PeerUnavailable(to.clone()));
        }
        let inbox = self
            .endpoints
            .get(to)
            .filter(|endpoint| endpoint.reachable)
            .map(|endpoint| endpoint.inbox.clone())
            .ok_or_else(|| TransportError::PeerUnavailable(to.clone()))?;
        inbox
            .send(frame)
            .map_err(|_| TransportError::PeerUnavailable(to.clone()))
    }
}

/// One node's handle on a [`LocalBus`]
#[derive(Debug)]
pub struct LocalTransport {
    bus: Arc<LocalBus>,
    node_id: NodeId,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> &NodeId {
        &self.node_id
    }

    async fn publish(&self, frame: Frame) -> TransportResult<()> {
        for peer in self.bus.peers_of(&self.node_id) {
            if let Err(e) = self.bus.deliver(&self.node_id, &peer, frame.clone()) {
                debug!(peer = %peer, error = %e, "Dropped published frame");
            }
        }
        Ok(())
    }

    async fn send(&self, to: &NodeId, frame: Frame) -> TransportResult<()> {
        self.bus.deliver(&self.node_id, to, frame)
    }

    fn subscribe(&self) -> TransportResult<mpsc::UnboundedReceiver<Frame>> {
        self.inbox
            .lock()
            .take()
            .ok_or_else(|| TransportError::AlreadySubscribed(self.node_id.clone()))
    }

    fn live_peers(&self) -> Vec<NodeId> {
        self.bus.peers_of(&self.node_id)
    }
}
