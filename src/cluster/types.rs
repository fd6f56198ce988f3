use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Routing tier: accepts application requests and stripes keys.
    Proxy,
    /// Storage tier: holds data and parity chunks.
    Server,
    /// Membership and degraded-lock service.
    Coordinator,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Normal,
    /// Reachable but shedding load; served in degraded mode.
    Overloaded,
    Unavailable,
}

/// A single member in the cluster.
///
/// The `incarnation` field orders status updates: a change is only accepted
/// when it carries a newer incarnation than the one already known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    pub addr: SocketAddr,
    pub status: NodeStatus,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    pub fn new(id: NodeId, role: NodeRole, addr: SocketAddr) -> Self {
        Self {
            id,
            role,
            addr,
            status: NodeStatus::Normal,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }
}
