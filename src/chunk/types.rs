use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::arena::Chunk;

/// Stripe coordinate of a chunk: which list, which stripe, which slot of the stripe.
///
/// Slots `0..k` are data chunks, `k..k+m` are parity chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
}

impl ChunkId {
    pub fn new(list_id: u32, stripe_id: u32, chunk_id: u32) -> Self {
        Self {
            list_id,
            stripe_id,
            chunk_id,
        }
    }

    /// The same stripe coordinate at another slot.
    pub fn with_slot(&self, chunk_id: u32) -> Self {
        Self { chunk_id, ..*self }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.list_id, self.stripe_id, self.chunk_id
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Allocated, nothing written yet.
    Empty,
    /// Open for writes.
    Dirty,
    /// Frozen; only deletes and in-place updates may touch it.
    Sealed,
    /// Sealed and handed to persistence; bytes must be read back before use.
    NeedsLoadFromDisk,
    /// Rebuilt from surviving peers while its owner is unavailable.
    Reconstructed,
}

/// Where the latest version of a key lives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KeyLocation {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
    /// Offset of the record inside the chunk arena.
    pub offset: u32,
    /// Full record length (header, key and value).
    pub length: u32,
}

impl KeyLocation {
    pub fn chunk(&self) -> ChunkId {
        ChunkId::new(self.list_id, self.stripe_id, self.chunk_id)
    }
}

/// One key of a sealed chunk, as announced to parity holders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealRecord {
    pub key: String,
    pub offset: u32,
    pub length: u32,
}

/// A data-side change expressed as `old XOR new` starting at `offset`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteDelta {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl ByteDelta {
    pub fn is_noop(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

/// A chunk shared between its owning buffer slot and the key index.
pub type SharedChunk = Arc<RwLock<Chunk>>;
