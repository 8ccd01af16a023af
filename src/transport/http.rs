// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! HTTP proxy backend.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout_at;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use super::http_codec::{HttpCodec, HttpMessage};
use super::{Request, Response};
use crate::client::{ClientConfig, RetryPolicy};
use crate::error::{ErrorCode, ServiceError, TransportError};

pub(crate) const API_PREFIX: &str = "/api/v4/";
pub(crate) const PARAMETERS_HEADER: &str = "X-YT-Parameters";
pub(crate) const CORRELATION_ID_HEADER: &str = "X-YT-Correlation-Id";
pub(crate) const RESPONSE_CODE_HEADER: &str = "X-YT-Response-Code";
pub(crate) const ERROR_HEADER: &str = "X-YT-Error";

type Connection = Framed<TcpStream, HttpCodec>;

/// Bounded set of keep-alive connections.
///
/// A semaphore bounds the number of open connections; idle ones wait in a
/// stack guarded by a single mutex.
#[derive(Debug)]
struct ConnectionPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    fn new(max_connections: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(Vec::with_capacity(max_connections)),
        }
    }

    fn take(&self) -> Option<Connection> {
        self.idle.lock().pop()
    }

    fn put(&self, connection: Connection) {
        self.idle.lock().push(connection);
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Request/response backend speaking the HTTP proxy protocol.
#[derive(Debug)]
pub struct HttpTransport {
    address: String,
    retry_policy: RetryPolicy,
    pool: ConnectionPool,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            address: config.cluster.clone(),
            retry_policy: config.retry_policy.clone(),
            pool: ConnectionPool::new(config.max_connections),
        }
    }

    /// Returns the number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    #[instrument(skip(self, request), fields(command = request.command))]
    pub async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let deadline = request.deadline;
        let _permit = match timeout_at(deadline, self.pool.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TransportError::connection_lost("connection pool closed")),
            Err(_) => {
                return Err(TransportError::timeout(
                    "timed out waiting for a pooled connection",
                ))
            }
        };

        let message = self.encode_request(&request)?;
        let mut connection = match self.pool.take() {
            Some(connection) => connection,
            None => Framed::new(
                super::connect(&self.address, &self.retry_policy, deadline).await?,
                HttpCodec::new(),
            ),
        };

        // On timeout or error the connection is dropped instead of being
        // returned: its state is unknown.
        let reply = match timeout_at(deadline, exchange(&mut connection, message)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(TransportError::timeout(format!(
                    "{} did not complete before its deadline",
                    request.command
                )))
            }
        };

        if !reply.wants_close() {
            self.pool.put(connection);
        }
        decode_response(&reply)
    }

    fn encode_request(&self, request: &Request) -> Result<HttpMessage, TransportError> {
        let mut params = request.params.clone();
        if let Some(id) = &request.transaction_id {
            params.insert("transaction_id".into(), serde_json::json!(id.as_str()));
        }
        let params = serde_json::to_string(&params)
            .map_err(|e| TransportError::protocol(format!("failed to encode parameters: {}", e)))?;
        let body = match &request.body {
            Some(body) => serde_json::to_vec(body)
                .map_err(|e| TransportError::protocol(format!("failed to encode body: {}", e)))?,
            None => Vec::new(),
        };
        let correlation_id = uuid::Uuid::new_v4().to_string();
        debug!(%correlation_id, "sending request");

        Ok(
            HttpMessage::request("POST", &format!("{}{}", API_PREFIX, request.command))
                .with_header("Host", self.address.as_str())
                .with_header("Content-Type", "application/json")
                .with_header("Accept", "application/json")
                .with_header(PARAMETERS_HEADER, params)
                .with_header(CORRELATION_ID_HEADER, correlation_id)
                .with_body(body),
        )
    }
}

async fn exchange(
    connection: &mut Connection,
    message: HttpMessage,
) -> Result<HttpMessage, TransportError> {
    connection.send(message).await?;
    match connection.next().await {
        Some(reply) => reply,
        None => Err(TransportError::connection_lost(
            "connection closed before a response was received",
        )),
    }
}

/// Maps an HTTP reply to a response.
///
/// Errors arrive either as a non-2xx status with the error as the body, or as
/// a 2xx status with a non-zero `X-YT-Response-Code` and the error in the
/// `X-YT-Error` header.
pub(crate) fn decode_response(reply: &HttpMessage) -> Result<Response, TransportError> {
    let status = reply.status()?;

    if (200..300).contains(&status) {
        if let Some(code) = reply.header(RESPONSE_CODE_HEADER) {
            if code.trim() != "0" {
                let error = match reply.header(ERROR_HEADER) {
                    Some(raw) => serde_json::from_str::<ServiceError>(raw).map_err(|e| {
                        TransportError::protocol(format!("malformed {} header: {}", ERROR_HEADER, e))
                    })?,
                    None => ServiceError::new(
                        ErrorCode(code.trim().parse().unwrap_or(1)),
                        "request failed without error details",
                    ),
                };
                return Ok(Response::failed(error));
            }
        }
        if reply.body.is_empty() {
            return Ok(Response::ok(None));
        }
        let body = serde_json::from_slice(&reply.body)
            .map_err(|e| TransportError::protocol(format!("malformed response body: {}", e)))?;
        return Ok(Response::ok(Some(body)));
    }

    let parsed = serde_json::from_slice::<ServiceError>(&reply.body).ok();
    let error = match (status, parsed) {
        (503, Some(err)) if !err.is_transient() => {
            ServiceError::new(ErrorCode::UNAVAILABLE, "service unavailable").with_inner(err)
        }
        (503, None) => ServiceError::new(ErrorCode::UNAVAILABLE, "service unavailable"),
        (_, Some(err)) => err,
        (status, None) => ServiceError::new(
            ErrorCode(1),
            format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&reply.body).trim()
            ),
        )
        .with_attribute("http_status", serde_json::json!(status)),
    };
    Ok(Response::failed(error))
}
