use tokio::sync::oneshot;

use super::protocol::{ClientRequest, ClientResponse, Envelope};

/// Work item of a node's event queue.
#[derive(Debug)]
pub enum NodeEvent {
    /// An application request accepted by a proxy.
    Client {
        request: ClientRequest,
        reply: oneshot::Sender<ClientResponse>,
    },
    /// A message from a peer.
    Peer(Envelope),
    /// A parked peer message resumed as a continuation; already admitted once.
    Resumed(Envelope),
    /// Periodic sweep of expired pending entries.
    Reap,
}

/// Which client operation a message or pending entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Set,
    Update,
    Delete,
}

impl From<&ClientRequest> for Op {
    fn from(request: &ClientRequest) -> Self {
        match request {
            ClientRequest::Get { .. } => Op::Get,
            ClientRequest::Set { .. } => Op::Set,
            ClientRequest::Update { .. } => Op::Update,
            ClientRequest::Delete { .. } => Op::Delete,
        }
    }
}
