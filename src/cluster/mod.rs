//! Cluster Membership and Placement
//!
//! Every process keeps a [`ClusterView`] of the proxies, servers and the
//! coordinator it talks to. The coordinator is the authority on server status:
//! it detects silent servers through heartbeats and broadcasts status changes
//! stamped with an incarnation number.
//!
//! [`StripeList`] maps a key onto a stripe list (`k` data holders followed by
//! `m` parity holders) and a data slot within it.

pub mod placement;
pub mod types;
pub mod view;

pub use placement::{KeyPlacement, ListPeers, Placement, StripeList};
pub use types::{Node, NodeId, NodeRole, NodeStatus};
pub use view::ClusterView;

#[cfg(test)]
mod tests;
