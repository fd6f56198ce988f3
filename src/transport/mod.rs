//! Message Transport
//!
//! Moves [`Envelope`]s between nodes and drops them into the receiver's
//! [`EventQueue`](crate::event::EventQueue). The core never waits on a send:
//! a delivery failure either surfaces immediately as an error or, for the
//! HTTP transport, is logged and left to the pending-entry lease.
//!
//! ## Responsibilities
//! - Route control traffic (acknowledgements, status changes) to the
//!   priority side of the receiving queue.
//! - [`LocalTransport`]: in-process routing between nodes sharing a process,
//!   with a per-node down switch and a log of sent messages.
//! - [`HttpTransport`]: bincode envelopes posted to `/internal/message`
//!   with bounded retry and jittered backoff.

pub mod handlers;
pub mod http;
pub mod local;

pub use http::HttpTransport;
pub use local::{LocalTransport, SentMessage};

use crate::cluster::types::NodeId;
use crate::error::Result;
use crate::event::EventQueue;
use crate::node::protocol::{Envelope, Message};
use crate::node::types::NodeEvent;

pub trait Transport: Send + Sync {
    fn send(&self, from: &NodeId, to: &NodeId, message: Message) -> Result<()>;
}

/// Hands a received envelope to the node's queue.
pub fn deliver(queue: &EventQueue<NodeEvent>, envelope: Envelope) -> Result<()> {
    if envelope.message.is_control() {
        queue.prioritized_insert(NodeEvent::Peer(envelope))
    } else {
        queue.insert(NodeEvent::Peer(envelope))
    }
}
