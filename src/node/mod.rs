//! Node Roles
//!
//! A process runs one role, driven by its own [`EventQueue`](crate::event::EventQueue)
//! and worker pool:
//!
//! - **`proxy`**: accepts application requests, stripes keys onto data
//!   servers and reroutes through a reconstructor when the owner is down.
//! - **`server`**: holds data and parity chunk buffers, keeps parity in step
//!   with every sealed chunk, and rebuilds lost chunks on request
//!   (`reconstruction`).
//! - **`coordinator`**: membership authority and degraded-lock service.
//!
//! Every cross-node wait is an entry in a pending table, completed by the
//! event carrying the response. No handler ever blocks on the network.

pub mod context;
pub mod coordinator;
pub mod handlers;
pub mod protocol;
pub mod proxy;
mod reconstruction;
pub mod server;
pub mod types;

pub use context::NodeContext;
pub use coordinator::CoordinatorNode;
pub use proxy::ProxyNode;
pub use server::ServerNode;

#[cfg(test)]
mod harness;
