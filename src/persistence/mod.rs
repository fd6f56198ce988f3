//! Chunk Persistence
//!
//! Sealed chunks are handed to a [`Persistence`] backend. Chunks evicted from
//! memory are marked `NeedsLoadFromDisk` and faulted back in through
//! [`Persistence::read`] before they are served.

pub mod memory;

pub use memory::MemoryStorage;

use crate::chunk::{Chunk, ChunkId};
use crate::error::Result;

pub trait Persistence: Send + Sync {
    fn write(&self, chunk: &Chunk) -> Result<()>;
    fn read(&self, id: ChunkId, is_parity: bool) -> Result<Option<Chunk>>;
}
