//! Cluster Network Protocol
//!
//! Defines the messages exchanged between proxies, servers and the
//! coordinator, and the DTOs of the client-facing HTTP API.
//!
//! Peer messages travel inside an [`Envelope`] naming the sender, so the
//! receiver can map it to a generational origin handle. Every request carries
//! a `request_id` chosen by the sender; the response echoes it back.

use serde::{Deserialize, Serialize};

use crate::buffer::ReplicaOp;
use crate::chunk::{ChunkId, KeyLocation, SealRecord};
use crate::cluster::types::{NodeId, NodeStatus};
use crate::degraded::{DegradedLockResult, DegradedOpKind};
use crate::error::ErrorCode;

// --- API Endpoints ---

/// Internal endpoint receiving bincode-encoded envelopes.
pub const ENDPOINT_MESSAGE: &str = "/internal/message";
/// Public endpoint for client writes.
pub const ENDPOINT_PUT: &str = "/put";
/// Public endpoint for client reads.
pub const ENDPOINT_GET: &str = "/get";
/// Public endpoint for in-place value updates.
pub const ENDPOINT_UPDATE: &str = "/update";
/// Public endpoint for deletions.
pub const ENDPOINT_DELETE: &str = "/delete";
/// Coordinator endpoints to mark a server failed or recovered.
pub const ENDPOINT_ADMIN_FAIL: &str = "/admin/fail";
pub const ENDPOINT_ADMIN_RECOVER: &str = "/admin/recover";

pub type RequestId = u64;

/// What a peer holds at a requested stripe coordinate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkReply {
    /// A sealed data chunk (full arena).
    Sealed(Vec<u8>),
    /// The accumulated parity chunk (full arena), the data chunks not folded
    /// into it yet, and the replicated records of the requested lost chunk.
    Parity {
        bytes: Vec<u8>,
        pending: Vec<bool>,
        replicas: Vec<(String, Vec<u8>)>,
    },
    /// Nothing sealed at this coordinate yet; contributes zeros.
    Empty,
    /// The chunk exists but could not be read.
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // Proxy -> data server.
    Get {
        request_id: RequestId,
        key: String,
    },
    GetResponse {
        request_id: RequestId,
        key: String,
        result: Result<Vec<u8>, ErrorCode>,
    },
    Set {
        request_id: RequestId,
        key: String,
        value: Vec<u8>,
    },
    SetResponse {
        request_id: RequestId,
        key: String,
        result: Result<KeyLocation, ErrorCode>,
    },
    Update {
        request_id: RequestId,
        key: String,
        offset: u32,
        value: Vec<u8>,
    },
    UpdateResponse {
        request_id: RequestId,
        key: String,
        result: Result<(), ErrorCode>,
    },
    Delete {
        request_id: RequestId,
        key: String,
    },
    DeleteResponse {
        request_id: RequestId,
        key: String,
        result: Result<(), ErrorCode>,
    },

    // Proxy -> reconstructor. Answered with the response of the wrapped op.
    Degraded {
        request_id: RequestId,
        lost: NodeId,
        location: KeyLocation,
        key: String,
        op: DegradedOpKind,
    },

    // Data server -> parity servers.
    Seal {
        request_id: RequestId,
        list_id: u32,
        stripe_id: u32,
        chunk_id: u32,
        bytes: Vec<u8>,
        records: Vec<SealRecord>,
    },
    SealResponse {
        request_id: RequestId,
        result: Result<(), ErrorCode>,
    },
    ParityUpdate {
        request_id: RequestId,
        list_id: u32,
        stripe_id: u32,
        chunk_id: u32,
        key: String,
        offset: u32,
        delta: Vec<u8>,
    },
    ParityUpdateResponse {
        request_id: RequestId,
        result: Result<(), ErrorCode>,
    },
    // Writes to keys of a data chunk that has not sealed yet.
    Replicate {
        request_id: RequestId,
        list_id: u32,
        stripe_id: u32,
        chunk_id: u32,
        key: String,
        op: ReplicaOp,
    },
    ReplicateResponse {
        request_id: RequestId,
        result: Result<(), ErrorCode>,
    },

    // Proxy -> coordinator.
    DegradedLock {
        request_id: RequestId,
        location: KeyLocation,
        key: String,
        lost: NodeId,
    },
    DegradedLockResponse {
        request_id: RequestId,
        result: DegradedLockResult,
    },

    // Reconstructor -> stripe peers.
    GetChunk {
        request_id: RequestId,
        list_id: u32,
        stripe_id: u32,
        chunk_id: u32,
        /// The data chunk being rebuilt; parity holders attach its replicas.
        lost_chunk_id: u32,
    },
    GetChunkResponse {
        request_id: RequestId,
        reply: ChunkReply,
    },

    // Reconstructor -> recovered server: every chunk rebuilt on its behalf.
    SetChunk {
        request_id: RequestId,
        chunks: Vec<(ChunkId, Vec<u8>)>,
    },
    SetChunkResponse {
        request_id: RequestId,
        /// Number of chunks installed.
        result: Result<usize, ErrorCode>,
    },

    // Coordinator -> reconstructors.
    ReleaseDegraded {
        request_id: RequestId,
        node: NodeId,
    },
    ReleaseDegradedResponse {
        request_id: RequestId,
        count: usize,
    },

    // Coordinator -> everyone.
    NodeStatus {
        node: NodeId,
        status: NodeStatus,
        incarnation: u64,
    },

    // Server -> coordinator.
    Heartbeat,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Get { .. } => "Get",
            Message::GetResponse { .. } => "GetResponse",
            Message::Set { .. } => "Set",
            Message::SetResponse { .. } => "SetResponse",
            Message::Update { .. } => "Update",
            Message::UpdateResponse { .. } => "UpdateResponse",
            Message::Delete { .. } => "Delete",
            Message::DeleteResponse { .. } => "DeleteResponse",
            Message::Degraded { .. } => "Degraded",
            Message::Seal { .. } => "Seal",
            Message::SealResponse { .. } => "SealResponse",
            Message::ParityUpdate { .. } => "ParityUpdate",
            Message::ParityUpdateResponse { .. } => "ParityUpdateResponse",
            Message::Replicate { .. } => "Replicate",
            Message::ReplicateResponse { .. } => "ReplicateResponse",
            Message::DegradedLock { .. } => "DegradedLock",
            Message::DegradedLockResponse { .. } => "DegradedLockResponse",
            Message::GetChunk { .. } => "GetChunk",
            Message::GetChunkResponse { .. } => "GetChunkResponse",
            Message::SetChunk { .. } => "SetChunk",
            Message::SetChunkResponse { .. } => "SetChunkResponse",
            Message::ReleaseDegraded { .. } => "ReleaseDegraded",
            Message::ReleaseDegradedResponse { .. } => "ReleaseDegradedResponse",
            Message::NodeStatus { .. } => "NodeStatus",
            Message::Heartbeat => "Heartbeat",
        }
    }

    /// Control traffic rides the priority side of the receiver's queue.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::SealResponse { .. }
                | Message::ParityUpdateResponse { .. }
                | Message::ReplicateResponse { .. }
                | Message::DegradedLockResponse { .. }
                | Message::ReleaseDegraded { .. }
                | Message::ReleaseDegradedResponse { .. }
                | Message::NodeStatus { .. }
                | Message::Heartbeat
        )
    }
}

/// A peer message tagged with its sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

// --- Client-facing types ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Get { key: String },
    Set { key: String, value: Vec<u8> },
    Update { key: String, offset: u32, value: Vec<u8> },
    Delete { key: String },
}

impl ClientRequest {
    pub fn key(&self) -> &str {
        match self {
            ClientRequest::Get { key }
            | ClientRequest::Set { key, .. }
            | ClientRequest::Update { key, .. }
            | ClientRequest::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    Value(Vec<u8>),
    Stored(KeyLocation),
    Updated,
    Deleted,
}

pub type ClientResponse = Result<ClientReply, ErrorCode>;

// --- HTTP DTOs ---

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub key: String,
    /// Byte offset inside the stored value.
    pub offset: u32,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    pub key: String,
    pub value: Option<String>,
}

/// Acknowledgment for writes, carrying the error code on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub error: Option<ErrorCode>,
    pub location: Option<KeyLocation>,
}
