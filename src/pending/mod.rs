//! Pending Correlation Layer
//!
//! Nothing in the cluster blocks on a network round-trip. Every cross-node
//! call records a [`PendingTable`] entry before the message is sent, and the
//! response handler erases it to resume the suspended operation.
//!
//! ## Core Concepts
//! - **One table per request category**: contention on one kind of request
//!   never blocks another. Each role composes the tables it needs.
//! - **Fan-out legs** share a request id and differ by origin handle, so
//!   `count(id)` tells the handler whether the leg it just erased was the last.
//! - **Typed origins**: [`Handle`] replaces connection pointers; a stale
//!   handle cannot match a reused slot.
//! - **Leases**: entries expire and are reaped into explicit failures.

pub mod handle;
pub mod table;
pub mod types;

pub use handle::{Handle, HandleArena, PeerRegistry};
pub use table::PendingTable;
pub use types::{PendingEntry, PendingIdentifier, PendingType, ReplyTo, Settled};

#[cfg(test)]
mod tests;
