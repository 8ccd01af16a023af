// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Frames of the multiplexed RPC wire.
//!
//! Each frame is one JSON document carried in a length-delimited envelope.
//! Every frame names the logical call it belongs to by `request_id`.
//!
//! Streamed replies are credit-controlled: a streaming request grants the
//! server `window` chunks, and the client returns one `Credit` per chunk it
//! consumes. The server never has more than `window` unacknowledged chunks
//! in flight.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{ServiceError, TransportError};
use crate::txn::TransactionId;

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Chunks a streaming call may have in flight before the reader consumes any.
pub const STREAM_WINDOW: u32 = 16;

/// Builds the length-delimited codec used by both ends of the RPC wire.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// JSON object used for command parameters.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Outcome of a call as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResult {
    Ok(Option<serde_json::Value>),
    Error(ServiceError),
}

/// One message on the RPC connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        request_id: u64,
        method: String,
        params: Params,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<TransactionId>,
        timeout_ms: u64,
        #[serde(default)]
        streaming: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<u32>,
    },
    /// Unary reply, or the header of a streamed reply.
    Response { request_id: u64, result: RpcResult },
    StreamChunk {
        request_id: u64,
        rows: Vec<serde_json::Value>,
    },
    StreamEnd {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ServiceError>,
    },
    /// Grants the server `chunks` more chunks of a streamed reply.
    Credit { request_id: u64, chunks: u32 },
    Cancel { request_id: u64 },
}

impl Frame {
    /// Returns the call this frame belongs to.
    pub fn request_id(&self) -> u64 {
        match self {
            Frame::Request { request_id, .. }
            | Frame::Response { request_id, .. }
            | Frame::StreamChunk { request_id, .. }
            | Frame::StreamEnd { request_id, .. }
            | Frame::Credit { request_id, .. }
            | Frame::Cancel { request_id } => *request_id,
        }
    }

    pub fn encode(&self) -> Result<Bytes, TransportError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::protocol(format!("failed to encode frame: {}", e)))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(buf)
            .map_err(|e| TransportError::protocol(format!("malformed frame: {}", e)))
    }
}
