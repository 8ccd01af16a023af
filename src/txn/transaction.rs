// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction handle and its state machine.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{PendingWrite, TransactionId, TxnState, WriteKind};
use crate::client::Client;
use crate::dispatcher::commands::{AbortTransaction, CommitTransaction, PingTransaction};
use crate::error::Error;
use crate::path::YPath;
use crate::schema::Row;

/// A tablet transaction.
///
/// Cloning yields another handle to the same transaction. Dropping the last
/// handle of a transaction that is still active aborts it in the background.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    start_timestamp: u64,
    timeout: Duration,
    state: Mutex<TxnState>,
    /// Failure that aborted the transaction without the caller asking.
    abort_cause: Mutex<Option<Error>>,
    pending: Mutex<Vec<PendingWrite>>,
    client: Client,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        start_timestamp: u64,
        timeout: Duration,
        client: Client,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                start_timestamp,
                timeout,
                state: Mutex::new(TxnState::Active),
                abort_cause: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                client,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<TransactionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TransactionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn is_same(&self, weak: &Weak<TransactionInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), weak.as_ptr())
    }

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Returns the transaction id.
    #[inline]
    pub fn id(&self) -> &TransactionId {
        &self.inner.id
    }

    /// Returns the snapshot timestamp reads inside the transaction observe.
    #[inline]
    pub fn start_timestamp(&self) -> u64 {
        self.inner.start_timestamp
    }

    /// Returns the lease requested at start.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> TxnState {
        *self.inner.state.lock()
    }

    /// Returns the failure that aborted the transaction, unless the abort was
    /// requested through [`abort`](Self::abort) or a failing scope.
    pub fn abort_cause(&self) -> Option<Error> {
        self.inner.abort_cause.lock().clone()
    }

    /// Returns true if the transaction is active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Returns the mutations issued so far, in issue order.
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.inner.pending.lock().clone()
    }

    /// Returns the number of mutations issued so far.
    #[inline]
    pub fn write_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Fails unless the transaction accepts operations.
    pub(crate) fn ensure_active(&self) -> Result<(), Error> {
        let state = self.state();
        if state != TxnState::Active {
            return Err(Error::InvalidArgument(format!(
                "transaction {} is {}",
                self.inner.id, state
            )));
        }
        Ok(())
    }

    pub(crate) fn record_writes(&self, table: &YPath, kind: WriteKind, rows: Vec<Row>) {
        let mut pending = self.inner.pending.lock();
        pending.extend(rows.into_iter().map(|row| PendingWrite {
            table: table.clone(),
            kind,
            row,
        }));
    }

    /// Updates the state after an operation in this transaction failed.
    pub(crate) fn observe(&self, err: &Error) {
        if let Error::TransactionExpired { .. } = err {
            let mut state = self.inner.state.lock();
            if *state == TxnState::Active {
                warn!(txn = %self.inner.id, "transaction lease expired");
                *self.inner.abort_cause.lock() = Some(err.clone());
                *state = TxnState::Aborted;
            }
        }
    }

    fn transition(&self, from: TxnState, to: TxnState) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if *state != from {
            return Err(Error::InvalidArgument(format!(
                "transaction {} is {}",
                self.inner.id, *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: TxnState) {
        *self.inner.state.lock() = to;
    }

    fn fail(&self, cause: Error) {
        *self.inner.abort_cause.lock() = Some(cause);
        self.set_state(TxnState::Aborted);
    }

    /// Commits the transaction.
    ///
    /// On success the state becomes `Committed`. A rejection by the service
    /// leaves it `Aborted`: a lost conflict fails with
    /// [`Error::TransactionConflict`], an expired lease with
    /// [`Error::TransactionExpired`], and any other rejection also issues a
    /// best-effort abort.
    ///
    /// When no answer arrives ([`Error::Timeout`] or a transport failure) the
    /// commit may have been applied. The state stays `Committing`, no abort is
    /// sent and the lease decides the outcome.
    #[instrument(skip(self), fields(txn = %self.inner.id))]
    pub async fn commit(&self) -> Result<(), Error> {
        self.transition(TxnState::Active, TxnState::Committing)?;

        let command = CommitTransaction {
            transaction_id: self.inner.id.clone(),
        };
        let err = match self.inner.client.dispatcher().execute(&command).await {
            Ok(()) => {
                self.set_state(TxnState::Committed);
                info!(writes = self.write_count(), "transaction committed");
                return Ok(());
            }
            Err(err) => err,
        };

        match &err {
            Error::Timeout(_) | Error::Transport(_) => {
                warn!(error = %err, "commit outcome unknown, leaving it to the lease");
                return Err(err);
            }
            Error::TransactionConflict { .. } | Error::TransactionExpired { .. } => {
                self.fail(err.clone());
                warn!(error = %err, "transaction aborted at commit");
            }
            _ => {
                self.fail(err.clone());
                warn!(error = %err, "commit rejected, aborting");
                self.send_abort().await;
            }
        }
        Err(err)
    }

    /// Aborts the transaction.
    ///
    /// The state becomes `Aborted` before the request is sent, so the
    /// transaction is terminal even if the request fails.
    #[instrument(skip(self), fields(txn = %self.inner.id))]
    pub async fn abort(&self) -> Result<(), Error> {
        self.transition(TxnState::Active, TxnState::Aborted)?;
        info!("transaction aborted");
        self.execute_abort().await
    }

    /// Renews the lease.
    #[instrument(skip(self), fields(txn = %self.inner.id))]
    pub async fn ping(&self) -> Result<(), Error> {
        self.ensure_active()?;
        let command = PingTransaction {
            transaction_id: self.inner.id.clone(),
        };
        let result = self.inner.client.dispatcher().execute(&command).await;
        if let Err(err) = &result {
            self.observe(err);
        }
        result
    }

    /// Aborts if still active and swallows failures.
    pub(crate) async fn abort_best_effort(&self) {
        if self.transition(TxnState::Active, TxnState::Aborted).is_ok() {
            info!(txn = %self.inner.id, "transaction aborted");
            self.send_abort().await;
        }
    }

    async fn send_abort(&self) {
        if let Err(err) = self.execute_abort().await {
            warn!(txn = %self.inner.id, error = %err, "best-effort abort failed");
        }
    }

    async fn execute_abort(&self) -> Result<(), Error> {
        let command = AbortTransaction {
            transaction_id: self.inner.id.clone(),
        };
        match self.inner.client.dispatcher().execute(&command).await {
            // The service already forgot it; nothing left to abort.
            Ok(()) | Err(Error::TransactionExpired { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("start_timestamp", &self.inner.start_timestamp)
            .field("state", &self.state())
            .field("writes", &self.write_count())
            .finish()
    }
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        if *self.state.get_mut() != TxnState::Active {
            return;
        }
        warn!(txn = %self.id, "active transaction dropped, aborting");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let command = AbortTransaction {
            transaction_id: self.id.clone(),
        };
        runtime.spawn(async move {
            if let Err(err) = client.dispatcher().execute(&command).await {
                debug!(txn = %command.transaction_id, error = %err, "background abort failed");
            }
        });
    }
}
