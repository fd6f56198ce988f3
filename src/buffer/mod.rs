//! Chunk Buffers
//!
//! Buffers own the chunks that are still changing.
//!
//! ## Responsibilities
//! - **Data buffer**: picks an open chunk for every new record, seals chunks
//!   when they fill up and opens their replacement on the next stripe id.
//!   Compacted sealed chunks are re-inserted and reused for writes.
//! - **Parity buffer**: accumulates erasure-coded parity per stripe from seal
//!   and update notifications that may arrive in any order, deferring updates
//!   that overtake the seal of their data chunk. Until a data chunk seals,
//!   its keys are mirrored here as replicas.

pub mod data;
pub mod parity;

pub use data::{BufferGuard, DataChunkBuffer, Modification, SealedChunk, SetOutcome, SlotGuard};
pub use parity::{
    DeferredUpdate, ParityApply, ParityChunkBuffer, ParityChunkWrapper, ParitySnapshot, ReplicaOp,
};

#[cfg(test)]
mod tests;
