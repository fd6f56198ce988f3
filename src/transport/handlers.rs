use axum::{body::Bytes, extract::Extension, http::StatusCode};
use std::sync::Arc;

use super::deliver;
use crate::error::EngineError;
use crate::event::EventQueue;
use crate::node::protocol::Envelope;
use crate::node::types::NodeEvent;

/// Receives a bincode envelope from a peer and enqueues it.
pub async fn handle_internal_message(
    Extension(queue): Extension<Arc<EventQueue<NodeEvent>>>,
    body: Bytes,
) -> StatusCode {
    let envelope: Envelope = match bincode::deserialize(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!("Failed to decode envelope: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    match deliver(&queue, envelope) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(EngineError::QueueFull) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            tracing::error!("Failed to enqueue envelope: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
