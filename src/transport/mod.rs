// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Channels to the remote service.
//!
//! Two backends share one operation, [`Transport::send`]:
//!
//! - [`HttpTransport`]: one request per pooled keep-alive connection, in the
//!   shape of the HTTP proxy API (`POST /api/v4/<command>`).
//! - [`RpcTransport`]: a single multiplexed connection carrying many calls,
//!   with streamed replies for bulk reads.
//!
//! The backend is picked once per client from
//! [`ClientConfig::backend`](crate::ClientConfig) and dispatched statically.
//! Transports report [`TransportError`]s and service rejections; whether a
//! failure is retried is decided by the dispatcher.

pub mod frame;
mod http;
pub mod http_codec;
mod rpc;

pub use frame::Params;
pub use http::HttpTransport;
pub use rpc::{ChunkStream, RpcTransport};

use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::client::{Backend, ClientConfig, RetryPolicy};
use crate::error::{ServiceError, TransportError};
use crate::txn::TransactionId;

/// One logical call.
#[derive(Debug, Clone)]
pub struct Request {
    /// Command name, e.g. `lookup_rows`.
    pub command: &'static str,
    pub params: Params,
    pub body: Option<serde_json::Value>,
    pub transaction_id: Option<TransactionId>,
    /// Point in time after which the call is abandoned.
    pub deadline: Instant,
    /// Ask for a streamed reply where the backend supports it.
    pub streaming: bool,
}

impl Request {
    pub fn new(command: &'static str, deadline: Instant) -> Self {
        Self {
            command,
            params: Params::new(),
            body: None,
            transaction_id: None,
            deadline,
            streaming: false,
        }
    }
}

/// Status of a completed call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseStatus {
    Ok,
    Failed(ServiceError),
}

/// Reply to a [`Request`].
#[derive(Debug)]
pub struct Response {
    pub status: ResponseStatus,
    pub body: Option<serde_json::Value>,
    /// Remaining row chunks of a streamed reply.
    pub stream: Option<ChunkStream>,
}

impl Response {
    pub fn ok(body: Option<serde_json::Value>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            body,
            stream: None,
        }
    }

    pub fn failed(error: ServiceError) -> Self {
        Self {
            status: ResponseStatus::Failed(error),
            body: None,
            stream: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Transport selected by configuration.
#[derive(Debug)]
pub enum Transport {
    Http(HttpTransport),
    Rpc(RpcTransport),
}

impl Transport {
    /// Creates the backend named by `config.backend`. No connection is opened yet.
    pub fn new(config: &ClientConfig) -> Self {
        match config.backend {
            Backend::Http => Transport::Http(HttpTransport::new(config)),
            Backend::Rpc => Transport::Rpc(RpcTransport::new(config)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Transport::Http(_) => Backend::Http,
            Transport::Rpc(_) => Backend::Rpc,
        }
    }

    /// Returns true if replies can be streamed chunk by chunk.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, Transport::Rpc(_))
    }

    /// Sends one request and waits for its reply or the request deadline.
    pub async fn send(&self, request: Request) -> Result<Response, TransportError> {
        match self {
            Transport::Http(http) => http.send(request).await,
            Transport::Rpc(rpc) => rpc.send(request).await,
        }
    }
}

/// Opens a TCP connection, retrying failed attempts with backoff.
///
/// Nothing has been sent when a connect fails, so this is safe for every
/// command.
pub(crate) async fn connect(
    address: &str,
    policy: &RetryPolicy,
    deadline: Instant,
) -> Result<TcpStream, TransportError> {
    let mut attempt = 0u32;
    loop {
        let err = match timeout_at(deadline, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(err)) => err,
            Err(_) => {
                return Err(TransportError::timeout(format!(
                    "timed out connecting to {}",
                    address
                )))
            }
        };

        attempt += 1;
        let delay = policy.delay(attempt - 1);
        if attempt >= policy.max_attempts || Instant::now() + delay >= deadline {
            return Err(TransportError::connection_lost(format!(
                "failed to connect to {}: {}",
                address, err
            )));
        }
        warn!(address, attempt, error = %err, ?delay, "connect failed, retrying");
        tokio::time::sleep(delay).await;
    }
}
