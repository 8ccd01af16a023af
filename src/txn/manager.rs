// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Per-client transaction bookkeeping.

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use super::transaction::{Transaction, TransactionInner};
use super::TxnState;
use crate::client::Client;
use crate::dispatcher::commands::StartTransaction;
use crate::error::Error;

/// Starts transactions and tracks the client's ambient transaction stack.
///
/// The stack holds weak references: a transaction leaves it when it reaches
/// a terminal state, when its scope releases it, or when its last handle is
/// dropped.
#[derive(Debug, Default)]
pub struct TransactionManager {
    stack: Mutex<Vec<Weak<TransactionInner>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a tablet transaction and pushes it onto the ambient stack.
    pub(crate) async fn begin(&self, client: &Client, timeout: Duration) -> Result<Transaction, Error> {
        let started = client
            .dispatcher()
            .execute(&StartTransaction { timeout })
            .await?;
        let txn = Transaction::new(
            started.transaction_id,
            started.start_timestamp,
            timeout,
            client.clone(),
        );

        let depth = {
            let mut stack = self.stack.lock();
            stack.push(txn.downgrade());
            stack.len()
        };
        info!(
            txn = %txn.id(),
            start_timestamp = txn.start_timestamp(),
            depth,
            "transaction started"
        );
        Ok(txn)
    }

    /// Returns the innermost active transaction, if any.
    pub fn current(&self) -> Option<Transaction> {
        let mut stack = self.stack.lock();
        prune(&mut stack);
        stack.iter().rev().find_map(Transaction::upgrade)
    }

    /// Returns the number of open transactions on the stack.
    pub fn depth(&self) -> usize {
        let mut stack = self.stack.lock();
        prune(&mut stack);
        stack.len()
    }

    /// Removes a transaction from the stack.
    pub(crate) fn release(&self, txn: &Transaction) {
        self.stack.lock().retain(|entry| !txn.is_same(entry));
    }

    /// Runs `f` inside a new transaction.
    ///
    /// Commits when `f` succeeds and the transaction is still active. When
    /// `f` fails, the transaction is aborted on a best-effort basis and the
    /// error of `f` is returned.
    ///
    /// If `f` succeeds after the transaction was aborted by a failure (an
    /// expired lease, a lost conflict) rather than by `f` itself, nothing
    /// was committed and that failure is returned.
    pub(crate) async fn run<F, Fut, T>(
        &self,
        client: &Client,
        timeout: Duration,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let txn = self.begin(client, timeout).await?;

        let result = match f(txn.clone()).await {
            Ok(value) => match txn.state() {
                TxnState::Active => txn.commit().await.map(|()| value),
                TxnState::Aborted => match txn.abort_cause() {
                    Some(cause) => Err(cause),
                    None => Ok(value),
                },
                TxnState::Committing | TxnState::Committed => Ok(value),
            },
            Err(err) => {
                txn.abort_best_effort().await;
                Err(err)
            }
        };

        self.release(&txn);
        result
    }
}

fn prune(stack: &mut Vec<Weak<TransactionInner>>) {
    stack.retain(|entry| Transaction::upgrade(entry).is_some_and(|txn| txn.is_active()));
}
