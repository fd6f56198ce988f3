//! Degraded Operation and Reconstruction
//!
//! When the owner of a chunk is unavailable or overloaded, operations on it
//! are served by a reconstructor node instead.
//!
//! ## Core Concepts
//! - **States**: `Normal -> AwaitingLock -> AwaitingChunks -> Reconstructing -> Resolved`.
//!   The lock phase lives on the proxy; the rest is tracked here.
//! - **Deduplication**: the first operation on a lost chunk starts the fan-out;
//!   concurrent ones are appended as waiters and resolved together.
//! - **Cache**: reconstructed chunks stay in the map's own key index, so later
//!   operations skip reconstruction until the lost node is released.
//! - **Rebuild**: a sealed chunk is decoded from the stripe, zeroing data
//!   slots the parity has not folded yet. A chunk that never reached parity
//!   is rebuilt from the parity holders' replicas.

pub mod map;
pub mod rebuild;
pub mod types;

pub use map::{Begin, ChunkProgress, DegradedMap};
pub use rebuild::{Rebuild, plan_rebuild};
pub use types::{DegradedLockResult, DegradedOp, DegradedOpKind, DegradedState, SlotContent};
