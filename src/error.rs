//! Engine Error Taxonomy
//!
//! Every fallible operation in the storage core returns [`EngineError`]. Local
//! bookkeeping failures never abort a worker: the node handling the event turns
//! them into an explicit failure response for the originator of the operation.
//!
//! [`ErrorCode`] is the serialisable mirror sent back over the wire inside
//! response messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::types::ChunkId;
use crate::cluster::types::NodeId;
use crate::pending::types::PendingType;

/// Errors raised by the storage core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// A correlation entry with the same `(request_id, origin)` already exists.
    #[error("duplicate {kind} request {request_id}")]
    DuplicateRequest { kind: PendingType, request_id: u64 },

    /// A response arrived for a request that is unknown or already expired.
    #[error("no pending {kind} entry for request {request_id}")]
    CorrelationMiss { kind: PendingType, request_id: u64 },

    /// Fewer than `k` chunks of a stripe could be gathered.
    #[error("insufficient chunks: {available} available, {required} required")]
    InsufficientChunks { available: usize, required: usize },

    /// The bookkeeping entry for one leg of a fan-out could not be recorded.
    #[error("failed to record pending {kind} entry for request {request_id}")]
    PendingMapInsertFailure { kind: PendingType, request_id: u64 },

    /// A second deferred parity update for a key that is still waiting on its seal.
    #[error("deferred update already pending for key {key:?} in {chunk}")]
    PoisonedDeferredUpdate { key: String, chunk: ChunkId },

    #[error("byte range {offset}..{end} exceeds chunk capacity {capacity}")]
    OutOfRange { offset: usize, end: usize, capacity: usize },

    #[error("record of {size} bytes does not fit a {capacity} byte chunk")]
    RecordTooLarge { size: usize, capacity: usize },

    #[error("key not found: {0:?}")]
    KeyNotFound(String),

    #[error("key already exists: {0:?}")]
    KeyExists(String),

    #[error("chunk {0} is not resident in memory")]
    ChunkNotResident(ChunkId),

    #[error("node {0:?} is unavailable")]
    NodeUnavailable(NodeId),

    #[error("node {node:?} does not own {what}")]
    NotOwner { node: NodeId, what: String },

    #[error("event queue is full")]
    QueueFull,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Wire representation of a failed operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    DuplicateRequest,
    CorrelationMiss,
    InsufficientChunks,
    PendingMapInsertFailure,
    PoisonedDeferredUpdate,
    OutOfRange,
    RecordTooLarge,
    KeyNotFound,
    KeyExists,
    ChunkNotResident,
    NodeUnavailable,
    NotOwner,
    QueueFull,
    Timeout,
    InvalidConfig,
    Persistence,
    Transport,
}

impl From<&EngineError> for ErrorCode {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::DuplicateRequest { .. } => ErrorCode::DuplicateRequest,
            EngineError::CorrelationMiss { .. } => ErrorCode::CorrelationMiss,
            EngineError::InsufficientChunks { .. } => ErrorCode::InsufficientChunks,
            EngineError::PendingMapInsertFailure { .. } => ErrorCode::PendingMapInsertFailure,
            EngineError::PoisonedDeferredUpdate { .. } => ErrorCode::PoisonedDeferredUpdate,
            EngineError::OutOfRange { .. } => ErrorCode::OutOfRange,
            EngineError::RecordTooLarge { .. } => ErrorCode::RecordTooLarge,
            EngineError::KeyNotFound(_) => ErrorCode::KeyNotFound,
            EngineError::KeyExists(_) => ErrorCode::KeyExists,
            EngineError::ChunkNotResident(_) => ErrorCode::ChunkNotResident,
            EngineError::NodeUnavailable(_) => ErrorCode::NodeUnavailable,
            EngineError::NotOwner { .. } => ErrorCode::NotOwner,
            EngineError::QueueFull => ErrorCode::QueueFull,
            EngineError::Timeout => ErrorCode::Timeout,
            EngineError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            EngineError::Persistence(_) => ErrorCode::Persistence,
            EngineError::Transport(_) => ErrorCode::Transport,
        }
    }
}

impl From<EngineError> for ErrorCode {
    fn from(error: EngineError) -> Self {
        ErrorCode::from(&error)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mirrors_variant() {
        let error = EngineError::InsufficientChunks {
            available: 2,
            required: 3,
        };
        assert_eq!(ErrorCode::from(&error), ErrorCode::InsufficientChunks);
        assert!(error.to_string().contains("2 available"));
    }

    #[test]
    fn test_poisoned_update_message_names_key() {
        let error = EngineError::PoisonedDeferredUpdate {
            key: "user:1".to_string(),
            chunk: ChunkId::new(0, 4, 1),
        };
        assert!(error.to_string().contains("user:1"));
        assert_eq!(ErrorCode::from(error), ErrorCode::PoisonedDeferredUpdate);
    }
}
