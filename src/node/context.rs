use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::protocol::{Envelope, Message};
use super::types::NodeEvent;
use crate::cluster::types::NodeId;
use crate::cluster::{ClusterView, StripeList};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::EventQueue;
use crate::pending::{Handle, PeerRegistry};
use crate::transport::Transport;

/// Everything a node role shares with its collaborators, built once at startup.
pub struct NodeContext {
    pub id: NodeId,
    pub coordinator: NodeId,
    pub config: Arc<EngineConfig>,
    pub view: Arc<ClusterView>,
    pub placement: Arc<StripeList>,
    pub transport: Arc<dyn Transport>,
    pub events: Arc<EventQueue<NodeEvent>>,
    peers: Mutex<PeerRegistry>,
    next_request_id: AtomicU64,
}

impl NodeContext {
    pub fn new(
        id: NodeId,
        coordinator: NodeId,
        config: Arc<EngineConfig>,
        view: Arc<ClusterView>,
        placement: Arc<StripeList>,
        transport: Arc<dyn Transport>,
        events: Arc<EventQueue<NodeEvent>>,
    ) -> Self {
        Self {
            id,
            coordinator,
            config,
            view,
            placement,
            transport,
            events,
            peers: Mutex::new(PeerRegistry::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn handle_for(&self, node: &NodeId) -> Handle {
        self.peers.lock().handle_for(node)
    }

    pub fn resolve(&self, handle: Handle) -> Option<NodeId> {
        self.peers.lock().resolve(handle)
    }

    /// Invalidates the peer's handle and returns it, so entries recorded
    /// under it can be drained.
    pub fn forget(&self, node: &NodeId) -> Handle {
        let mut peers = self.peers.lock();
        let handle = peers.handle_for(node);
        peers.forget(node);
        handle
    }

    pub fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        self.transport.send(&self.id, to, message)
    }

    /// Sends to the peer behind `origin`. A stale handle means the peer was
    /// torn down meanwhile; the message is dropped.
    pub fn reply(&self, origin: Handle, message: Message) {
        let Some(to) = self.resolve(origin) else {
            tracing::warn!("Dropping {}: origin handle is stale", message.kind());
            return;
        };
        if let Err(e) = self.send(&to, message) {
            tracing::warn!("Failed to answer {:?}: {}", to, e);
        }
    }

    /// Sends a message nobody waits on; failures are only logged.
    pub fn notify(&self, to: &NodeId, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.send(to, message) {
            tracing::debug!("Failed to send {} to {:?}: {}", kind, to, e);
        }
    }

    /// Re-enqueues a parked message as a continuation event.
    pub fn resume(&self, envelope: Envelope) -> Result<()> {
        self.events.insert(NodeEvent::Resumed(envelope))
    }

    pub fn not_owner(&self, what: impl Into<String>) -> EngineError {
        EngineError::NotOwner {
            node: self.id.clone(),
            what: what.into(),
        }
    }
}
