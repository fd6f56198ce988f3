use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;

use super::coordinator::CoordinatorNode;
use super::protocol::{
    AckResponse, ClientReply, ClientRequest, PutRequest, UpdateRequest, ValueResponse,
};
use super::proxy::ProxyNode;
use crate::cluster::types::NodeId;
use crate::error::ErrorCode;

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::KeyNotFound => StatusCode::NOT_FOUND,
        ErrorCode::KeyExists => StatusCode::CONFLICT,
        ErrorCode::RecordTooLarge | ErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
        ErrorCode::NodeUnavailable | ErrorCode::InsufficientChunks | ErrorCode::QueueFull => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ack(result: Result<ClientReply, ErrorCode>) -> (StatusCode, Json<AckResponse>) {
    match result {
        Ok(reply) => {
            let location = match reply {
                ClientReply::Stored(location) => Some(location),
                _ => None,
            };
            (
                StatusCode::OK,
                Json(AckResponse {
                    success: true,
                    error: None,
                    location,
                }),
            )
        }
        Err(code) => (
            status_for(code),
            Json(AckResponse {
                success: false,
                error: Some(code),
                location: None,
            }),
        ),
    }
}

pub async fn handle_put(
    Extension(proxy): Extension<Arc<ProxyNode>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<AckResponse>) {
    tracing::debug!("PUT {:?}", req.key);
    let request = ClientRequest::Set {
        key: req.key,
        value: req.value.into_bytes(),
    };
    ack(proxy.request(request).await)
}

pub async fn handle_get(
    Extension(proxy): Extension<Arc<ProxyNode>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<ValueResponse>) {
    let request = ClientRequest::Get { key: key.clone() };
    match proxy.request(request).await {
        Ok(ClientReply::Value(bytes)) => (
            StatusCode::OK,
            Json(ValueResponse {
                key,
                value: Some(String::from_utf8_lossy(&bytes).into_owned()),
            }),
        ),
        Ok(other) => {
            tracing::error!("Unexpected reply to GET {:?}: {:?}", key, other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ValueResponse { key, value: None }),
            )
        }
        Err(code) => {
            if code != ErrorCode::KeyNotFound {
                tracing::warn!("GET {:?} failed: {}", key, code);
            }
            (status_for(code), Json(ValueResponse { key, value: None }))
        }
    }
}

pub async fn handle_update(
    Extension(proxy): Extension<Arc<ProxyNode>>,
    Json(req): Json<UpdateRequest>,
) -> (StatusCode, Json<AckResponse>) {
    let request = ClientRequest::Update {
        key: req.key,
        offset: req.offset,
        value: req.value.into_bytes(),
    };
    ack(proxy.request(request).await)
}

pub async fn handle_delete(
    Extension(proxy): Extension<Arc<ProxyNode>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<AckResponse>) {
    ack(proxy.request(ClientRequest::Delete { key }).await)
}

pub async fn handle_admin_fail(
    Extension(coordinator): Extension<Arc<CoordinatorNode>>,
    Path(id): Path<String>,
) -> StatusCode {
    match coordinator.fail_node(&NodeId(id)) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!("Failed to mark node unavailable: {}", e);
            StatusCode::NOT_FOUND
        }
    }
}

pub async fn handle_admin_recover(
    Extension(coordinator): Extension<Arc<CoordinatorNode>>,
    Path(id): Path<String>,
) -> StatusCode {
    match coordinator.recover_node(&NodeId(id)) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!("Failed to start recovery: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
