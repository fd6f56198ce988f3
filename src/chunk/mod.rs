//! Chunk Storage Unit
//!
//! A chunk is the fixed-capacity byte arena that is both the unit of storage
//! and the unit of network transfer. Data chunks hold key-value records;
//! parity chunks hold the erasure-coded fold of the data chunks of a stripe.
//!
//! ## Core Concepts
//! - **Stripe coordinate**: `(list_id, stripe_id, chunk_id)` names a chunk cluster-wide.
//! - **Lifecycle**: `Empty -> Dirty -> Sealed`, then `NeedsLoadFromDisk` once
//!   evicted, or `Reconstructed` when rebuilt in degraded mode.
//! - **Compaction**: deleting a record shifts later records down so the tail
//!   of the arena stays zero-filled.

pub mod arena;
pub mod record;
pub mod types;

pub use arena::Chunk;
pub use types::{ByteDelta, ChunkId, ChunkStatus, KeyLocation, SealRecord, SharedChunk};
