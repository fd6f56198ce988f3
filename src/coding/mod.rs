//! Coding Engine
//!
//! Pure functions that produce, update and consume stripe parity.
//!
//! ## Core Concepts
//! - **Encode**: Parity over a byte range of all `k` data chunks; absent inputs count as zeros.
//! - **Fold**: Incremental parity maintenance from a data-side delta (`old XOR new`).
//! - **Decode**: Rebuilds missing slots from any `k` of the `k + m` chunks of a stripe.
//!
//! Nothing in here holds shared state, so concurrent calls on disjoint output
//! buffers are safe.

pub mod engine;
pub mod galois;

pub use engine::CodingEngine;

#[cfg(test)]
mod tests;
