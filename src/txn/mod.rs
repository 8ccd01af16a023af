// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Tablet transactions.
//!
//! A tablet transaction is started by the service, which hands back an id and
//! a snapshot timestamp. Row mutations that carry the id are applied
//! atomically when the transaction commits.
//!
//! # State machine
//!
//! ```text
//!            commit()                ok
//!   Active ──────────► Committing ───────► Committed
//!     │                    │
//!     │                    └── conflict / expiry / rejection ──► Aborted
//!     └── abort() / expiry / error in scope ───────────────────► Aborted
//! ```
//!
//! A transaction reaches at most one terminal state. Mutations are only
//! accepted while `Active`; a second commit or abort fails with
//! [`Error::InvalidArgument`](crate::Error::InvalidArgument).
//!
//! A commit that gets no answer (a timeout or a broken connection) may still
//! have been applied. Such a transaction stays `Committing`: no abort is sent
//! and the service-side lease settles it.
//!
//! # Scopes
//!
//! [`Client::run_in_transaction`](crate::Client::run_in_transaction) opens a
//! transaction, runs a closure, commits when the closure succeeds and aborts
//! when it fails. While open, the transaction sits on the client's ambient
//! stack, so row operations issued through the client attach to the innermost
//! active transaction. Nested scopes open independent transactions, not
//! sub-transactions.
//!
//! A [`Transaction`] may also be used explicitly; its row methods always
//! attach its own id.

mod manager;
mod transaction;

pub use manager::TransactionManager;
pub use transaction::Transaction;

use serde::{Deserialize, Serialize};

use crate::path::YPath;
use crate::schema::Row;

/// Identifier assigned to a transaction by the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

impl TxnState {
    /// Returns true for `Committed` and `Aborted`.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Committing => "committing",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Delete,
}

/// A mutation issued inside a transaction, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub table: YPath,
    pub kind: WriteKind,
    /// Full row for inserts, key row for deletes.
    pub row: Row,
}
