//! Erasure-Coded Key-Value Cluster Library
//!
//! This library crate defines the modules of a distributed key-value store
//! that keeps `k` data and `m` parity chunks per stripe and keeps serving
//! when a storage node is unavailable. The binary (`main.rs`) runs one node
//! role per process.
//!
//! ## Architecture Modules
//!
//! - **`coding`**: GF(2^8) erasure code. Encodes parity, folds byte deltas
//!   into it, and decodes any `k` surviving chunks of a stripe.
//! - **`chunk`**, **`index`**, **`buffer`**: the storage core. Records are
//!   packed into fixed-capacity chunks, sealed when full, and parity is kept
//!   in step through seal folds and update deltas.
//! - **`pending`**: correlation of asynchronous multi-hop requests with their
//!   responses, including fan-out collapse and lease expiry.
//! - **`degraded`**: the reconstruction state machine and the cache of
//!   chunks rebuilt on behalf of unavailable peers.
//! - **`cluster`**, **`event`**, **`transport`**, **`persistence`**: the
//!   membership view and stripe placement, the queue-and-worker runtime,
//!   message delivery between nodes, and sealed-chunk storage.
//! - **`node`**: the proxy, server and coordinator roles built on the above.

pub mod buffer;
pub mod chunk;
pub mod cluster;
pub mod coding;
pub mod config;
pub mod degraded;
pub mod error;
pub mod event;
pub mod index;
pub mod node;
pub mod pending;
pub mod persistence;
pub mod transport;
