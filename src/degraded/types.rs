use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;
use crate::cluster::types::NodeId;
use crate::pending::ReplyTo;

/// Progress of the reconstruction of one lost chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DegradedState {
    Normal,
    AwaitingLock,
    AwaitingChunks,
    Reconstructing,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DegradedOpKind {
    Get,
    Update { offset: u32, value: Vec<u8> },
    Delete,
}

/// What one stripe slot contributed to a reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotContent {
    Data(Vec<u8>),
    /// Parity bytes with the data chunks not folded into them yet, and the
    /// replicated records of the lost chunk.
    Parity {
        bytes: Vec<u8>,
        pending: Vec<bool>,
        replicas: Vec<(String, Vec<u8>)>,
    },
}

impl SlotContent {
    pub fn len(&self) -> usize {
        match self {
            SlotContent::Data(bytes) | SlotContent::Parity { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One suspended operation waiting on the reconstruction of its chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedOp {
    pub list_id: u32,
    pub stripe_id: u32,
    pub lost_chunk_id: u32,
    pub key: String,
    pub op: DegradedOpKind,
    pub reply: ReplyTo,
}

impl DegradedOp {
    pub fn chunk(&self) -> ChunkId {
        ChunkId::new(self.list_id, self.stripe_id, self.lost_chunk_id)
    }
}

/// Coordinator answer to a degraded-lock request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DegradedLockResult {
    /// Granted now; `reconstructor` must rebuild the chunk.
    IsLocked { reconstructor: NodeId },
    /// Already granted earlier; join the reconstruction at `reconstructor`.
    WasLocked { reconstructor: NodeId },
    /// The owner is healthy again; use the normal path.
    NotLocked,
    /// The chunk was handed back; send the request to `target`.
    Remapped { target: NodeId },
    /// Unknown list or no healthy node left to reconstruct.
    NotExist,
}
