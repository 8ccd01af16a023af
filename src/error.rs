// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every public operation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::txn::TransactionId;

/// Numeric error code reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);
    pub const CANCELED: ErrorCode = ErrorCode(1);
    pub const TIMEOUT: ErrorCode = ErrorCode(3);
    pub const TRANSPORT_ERROR: ErrorCode = ErrorCode(100);
    pub const UNAVAILABLE: ErrorCode = ErrorCode(105);
    pub const REQUEST_QUEUE_SIZE_LIMIT_EXCEEDED: ErrorCode = ErrorCode(108);
    pub const RESOLVE_ERROR: ErrorCode = ErrorCode(500);
    pub const ALREADY_EXISTS: ErrorCode = ErrorCode(501);
    pub const PREREQUISITE_CHECK_FAILED: ErrorCode = ErrorCode(1000);
    pub const TRANSACTION_LOCK_CONFLICT: ErrorCode = ErrorCode(1700);
    pub const TABLET_NOT_MOUNTED: ErrorCode = ErrorCode(1702);
    pub const NO_SUCH_TRANSACTION: ErrorCode = ErrorCode(11000);

    /// Returns a stable name for well-known codes.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::OK => "ok",
            ErrorCode::CANCELED => "canceled",
            ErrorCode::TIMEOUT => "timeout",
            ErrorCode::TRANSPORT_ERROR => "transport_error",
            ErrorCode::UNAVAILABLE => "unavailable",
            ErrorCode::REQUEST_QUEUE_SIZE_LIMIT_EXCEEDED => "request_queue_size_limit_exceeded",
            ErrorCode::RESOLVE_ERROR => "resolve_error",
            ErrorCode::ALREADY_EXISTS => "already_exists",
            ErrorCode::PREREQUISITE_CHECK_FAILED => "prerequisite_check_failed",
            ErrorCode::TRANSACTION_LOCK_CONFLICT => "transaction_lock_conflict",
            ErrorCode::TABLET_NOT_MOUNTED => "tablet_not_mounted",
            ErrorCode::NO_SUCH_TRANSACTION => "no_such_transaction",
            _ => "generic",
        }
    }

    /// Returns true for codes the dispatcher may retry on idempotent commands.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::TIMEOUT
                | ErrorCode::TRANSPORT_ERROR
                | ErrorCode::UNAVAILABLE
                | ErrorCode::REQUEST_QUEUE_SIZE_LIMIT_EXCEEDED
                | ErrorCode::PREREQUISITE_CHECK_FAILED
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Structured rejection returned by the remote service.
///
/// Errors form a tree: the top-level error usually wraps the root cause in
/// `inner_errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inner_errors: Vec<ServiceError>,
}

impl ServiceError {
    /// Creates an error without attributes or inner errors.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attributes: BTreeMap::new(),
            inner_errors: Vec::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Wraps another error as the cause of this one.
    pub fn with_inner(mut self, inner: ServiceError) -> Self {
        self.inner_errors.push(inner);
        self
    }

    /// Searches the error tree depth-first for the given code.
    pub fn find_matching(&self, code: ErrorCode) -> Option<&ServiceError> {
        if self.code == code {
            return Some(self);
        }
        self.inner_errors
            .iter()
            .find_map(|inner| inner.find_matching(code))
    }

    /// Returns true if any error in the tree carries a transient code.
    pub fn is_transient(&self) -> bool {
        self.code.is_transient() || self.inner_errors.iter().any(ServiceError::is_transient)
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code.0)?;
        for inner in &self.inner_errors {
            write!(f, "; caused by: {}", inner)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

/// Kinds of transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionLost,
    ProtocolViolation,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionLost => "connection-lost",
            TransportErrorKind::ProtocolViolation => "protocol-violation",
        }
    }
}

/// Failure of the channel to the remote service.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error ({}): {message}", .kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionLost, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ProtocolViolation, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::timeout(err.to_string()),
            std::io::ErrorKind::InvalidData => TransportError::protocol(err.to_string()),
            _ => TransportError::connection_lost(err.to_string()),
        }
    }
}

/// Errors surfaced by client operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("service error: {0}")]
    Service(ServiceError),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("transaction {id} aborted by conflict: {error}")]
    TransactionConflict {
        id: TransactionId,
        error: ServiceError,
    },

    #[error("transaction {id} expired")]
    TransactionExpired { id: TransactionId },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns the service code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Service(err) => Some(err.code),
            Error::TransactionConflict { error, .. } => Some(error.code),
            Error::TransactionExpired { .. } => Some(ErrorCode::NO_SUCH_TRANSACTION),
            Error::Timeout(_) => Some(ErrorCode::TIMEOUT),
            _ => None,
        }
    }

    /// Returns true if an idempotent command failing with this error may be retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Service(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        Error::Service(err)
    }
}
