use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use super::handle::Handle;

/// Category of an in-flight request. Each category has its own table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PendingType {
    AppGet,
    AppSet,
    AppUpdate,
    AppDelete,
    ServerGet,
    ServerSet,
    ServerUpdate,
    ServerDelete,
    DegradedLock,
    ParityUpdate,
    Seal,
    ChunkGet,
    ChunkSet,
    Release,
    /// Requests already applied on this node, kept to refuse redeliveries.
    Delivery,
}

impl fmt::Display for PendingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PendingType::AppGet => "application GET",
            PendingType::AppSet => "application SET",
            PendingType::AppUpdate => "application UPDATE",
            PendingType::AppDelete => "application DELETE",
            PendingType::ServerGet => "server GET",
            PendingType::ServerSet => "server SET",
            PendingType::ServerUpdate => "server UPDATE",
            PendingType::ServerDelete => "server DELETE",
            PendingType::DegradedLock => "degraded lock",
            PendingType::ParityUpdate => "parity update",
            PendingType::Seal => "seal",
            PendingType::ChunkGet => "chunk GET",
            PendingType::ChunkSet => "chunk SET",
            PendingType::Release => "release",
            PendingType::Delivery => "delivery",
        };
        f.write_str(name)
    }
}

/// Correlation key of one in-flight request.
///
/// `(request_id, origin)` is unique within a table. Fan-out legs share a
/// `request_id` and differ by `origin`; `parent_request_id` names the
/// upstream request to answer once the last leg completes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PendingIdentifier {
    pub request_id: u64,
    pub parent_request_id: u64,
    pub origin: Handle,
}

impl PendingIdentifier {
    pub fn new(request_id: u64, parent_request_id: u64, origin: Handle) -> Self {
        Self {
            request_id,
            parent_request_id,
            origin,
        }
    }

    pub fn key(&self) -> (u64, Handle) {
        (self.request_id, self.origin)
    }
}

/// Where a deferred response must go: the origin handle and its request id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReplyTo {
    pub origin: Handle,
    pub request_id: u64,
}

#[derive(Debug, Clone)]
pub struct PendingEntry<T> {
    pub id: PendingIdentifier,
    pub payload: T,
    pub expires_at: Instant,
}

/// An entry removed from its table, with the number of fan-out siblings
/// (same request id) still outstanding at the moment of removal.
#[derive(Debug, Clone)]
pub struct Settled<T> {
    pub entry: PendingEntry<T>,
    pub remaining: usize,
}

impl<T> Settled<T> {
    pub fn is_last(&self) -> bool {
        self.remaining == 0
    }
}
