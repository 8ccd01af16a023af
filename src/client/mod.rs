// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! User-facing table operations.
//!
//! A [`Client`] owns its transport, its configuration and its ambient
//! transaction stack; there is no process-wide state. Row operations issued
//! through the client attach to the innermost active transaction opened on
//! it, if any. The same operations on a [`Transaction`] always attach that
//! transaction.
//!
//! Rows are validated and encoded before anything is sent, so a
//! [`SchemaViolation`](crate::Error::SchemaViolation) never reaches the
//! service.

mod config;
mod rows;

pub use config::{Backend, ClientConfig, ReadFrom, RetryPolicy, BACKEND_ENV, PROXY_ENV};
pub use rows::RowStream;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::codec::{
    decode_row, encode_partial_rows, encode_rows, key_identity, EncodeMode, UnversionedRow,
};
use crate::dispatcher::commands::{
    CreateTable, DeleteRows, GetTableAttributes, GetTabletState, InsertBatch, InsertRows,
    LookupRows, MountState, MountTable, NodeExists, RemountTable, RemoveNode, SelectRows,
    UnmountTable,
};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::path::YPath;
use crate::schema::{Row, TableSchema};
use crate::txn::{Transaction, TransactionManager, WriteKind};

/// Options of [`Client::create_table`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Atomically replace whatever exists at the path.
    pub force: bool,
    /// Keep an existing table instead of failing.
    pub ignore_existing: bool,
}

impl CreateOptions {
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_ignore_existing(mut self, ignore_existing: bool) -> Self {
        self.ignore_existing = ignore_existing;
        self
    }
}

/// Options of inserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Overwrite only the columns each row names; other stored columns keep
    /// their values.
    pub update: bool,
    /// Merge values into aggregate columns with the column's function.
    pub aggregate: bool,
}

impl InsertOptions {
    pub fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }
}

/// Options of lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Columns to return, in order; all columns when `None`.
    pub column_names: Option<Vec<String>>,
    /// Overrides the client's read preference.
    pub read_from: Option<ReadFrom>,
    /// Reads the table as of this timestamp. Not allowed inside a transaction.
    pub timestamp: Option<u64>,
}

impl LookupOptions {
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_names = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = Some(read_from);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Options of queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Overrides the client's read preference.
    pub read_from: Option<ReadFrom>,
    /// Reads the tables as of this timestamp. Not allowed inside a transaction.
    pub timestamp: Option<u64>,
    pub input_row_limit: Option<u64>,
    pub output_row_limit: Option<u64>,
    /// When a row limit is hit, fail (the service default) or return the
    /// truncated result.
    pub fail_on_incomplete_result: Option<bool>,
}

impl SelectOptions {
    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = Some(read_from);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_input_row_limit(mut self, limit: u64) -> Self {
        self.input_row_limit = Some(limit);
        self
    }

    pub fn with_output_row_limit(mut self, limit: u64) -> Self {
        self.output_row_limit = Some(limit);
        self
    }

    pub fn with_fail_on_incomplete_result(mut self, fail: bool) -> Self {
        self.fail_on_incomplete_result = Some(fail);
        self
    }
}

/// A table as last seen by this client.
///
/// The handle caches the schema and mount state; the table itself lives on
/// independently of the handle.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHandle {
    path: YPath,
    schema: TableSchema,
    mount_state: MountState,
}

impl TableHandle {
    #[inline]
    pub fn path(&self) -> &YPath {
        &self.path
    }

    #[inline]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Mount state at the time the handle was obtained.
    #[inline]
    pub fn mount_state(&self) -> MountState {
        self.mount_state
    }
}

#[derive(Debug)]
struct ClientInner {
    dispatcher: Dispatcher,
    transactions: TransactionManager,
    schemas: Mutex<HashMap<YPath, TableSchema>>,
}

/// Client of one cluster.
///
/// Cheap to clone; clones share the transport and the transaction stack.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client. No connection is opened until the first call.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        debug!(cluster = %config.cluster, backend = %config.backend, "creating client");
        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher: Dispatcher::new(config),
                transactions: TransactionManager::new(),
                schemas: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Creates a client from `YT_PROXY` and `YT_BACKEND`.
    pub fn from_env() -> Result<Self, Error> {
        Self::new(ClientConfig::from_env()?)
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        self.inner.dispatcher.config()
    }

    #[inline]
    pub fn backend(&self) -> Backend {
        self.config().backend
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    // ---- tables ----

    /// Creates a dynamic table.
    ///
    /// With `force`, any existing node at `path` is replaced by the service
    /// in the same operation; on failure the path is left untouched.
    #[instrument(skip(self, schema), fields(path = %path))]
    pub async fn create_table(
        &self,
        path: &YPath,
        schema: TableSchema,
        options: CreateOptions,
    ) -> Result<TableHandle, Error> {
        self.forget_schema(path);
        let command = CreateTable {
            path: path.clone(),
            schema: schema.clone(),
            force: options.force,
            ignore_existing: options.ignore_existing,
        };
        self.dispatcher().execute(&command).await?;

        if options.ignore_existing {
            // The table may have existed with another schema.
            return self.get_table(path).await;
        }
        info!("table created");
        self.remember_schema(path, &schema);
        Ok(TableHandle {
            path: path.clone(),
            schema,
            mount_state: MountState::Unmounted,
        })
    }

    /// Opens a handle to an existing table.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn get_table(&self, path: &YPath) -> Result<TableHandle, Error> {
        let attributes = self
            .dispatcher()
            .execute(&GetTableAttributes { path: path.clone() })
            .await?;
        self.remember_schema(path, &attributes.schema);
        Ok(TableHandle {
            path: path.clone(),
            schema: attributes.schema,
            mount_state: attributes.tablet_state,
        })
    }

    /// Removes a node; with `force`, a missing node is not an error.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn remove(&self, path: &YPath, force: bool) -> Result<(), Error> {
        self.forget_schema(path);
        self.dispatcher()
            .execute(&RemoveNode {
                path: path.clone(),
                force,
            })
            .await
    }

    pub async fn exists(&self, path: &YPath) -> Result<bool, Error> {
        self.dispatcher()
            .execute(&NodeExists { path: path.clone() })
            .await
    }

    /// Mounts a table; with `sync`, waits until every tablet is mounted.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn mount_table(&self, path: &YPath, sync: bool) -> Result<(), Error> {
        self.dispatcher()
            .execute(&MountTable { path: path.clone() })
            .await?;
        if sync {
            self.dispatcher()
                .wait_for_tablet_state(path, MountState::Mounted)
                .await?;
        }
        Ok(())
    }

    /// Unmounts a table; with `sync`, waits until every tablet is unmounted.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn unmount_table(&self, path: &YPath, sync: bool) -> Result<(), Error> {
        self.dispatcher()
            .execute(&UnmountTable { path: path.clone() })
            .await?;
        if sync {
            self.dispatcher()
                .wait_for_tablet_state(path, MountState::Unmounted)
                .await?;
        }
        Ok(())
    }

    /// Pushes changed mount settings to the tablets of a mounted table.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn remount_table(&self, path: &YPath) -> Result<(), Error> {
        self.dispatcher()
            .execute(&RemountTable { path: path.clone() })
            .await
    }

    pub async fn get_tablet_state(&self, path: &YPath) -> Result<MountState, Error> {
        self.dispatcher()
            .execute(&GetTabletState { path: path.clone() })
            .await
    }

    /// Seeds the schema cache from a handle.
    ///
    /// Row operations validate against the cached schema of their table. On
    /// a cold cache the first operation fetches the schema with one `get`
    /// before validating; registering a handle obtained elsewhere lets
    /// validation run without that round trip.
    pub fn register_table(&self, table: &TableHandle) {
        self.remember_schema(&table.path, &table.schema);
    }

    // ---- rows ----

    /// Writes rows as one batch: either all rows are written or the call fails.
    pub async fn insert_rows(&self, path: &YPath, rows: Vec<Row>) -> Result<(), Error> {
        self.insert_rows_with_options(path, rows, InsertOptions::default())
            .await
    }

    pub async fn insert_rows_with_options(
        &self,
        path: &YPath,
        rows: Vec<Row>,
        options: InsertOptions,
    ) -> Result<(), Error> {
        let txn = self.current_transaction();
        self.write(path, rows, WriteKind::Insert, options, txn.as_ref())
            .await
    }

    /// Deletes rows by key as one batch.
    pub async fn delete_rows(&self, path: &YPath, keys: Vec<Row>) -> Result<(), Error> {
        let txn = self.current_transaction();
        self.write(path, keys, WriteKind::Delete, InsertOptions::default(), txn.as_ref())
            .await
    }

    /// Looks rows up by key.
    ///
    /// The result follows the order of the first occurrence of each key that
    /// is present; missing keys yield no row.
    pub async fn lookup_rows(
        &self,
        path: &YPath,
        keys: &[Row],
        options: LookupOptions,
    ) -> Result<Vec<Row>, Error> {
        let txn = self.current_transaction();
        self.lookup(path, keys, options, txn.as_ref()).await
    }

    /// Runs a query and returns its rows as a single-pass stream.
    pub async fn select_rows(&self, query: &str, options: SelectOptions) -> Result<RowStream, Error> {
        let txn = self.current_transaction();
        self.select(query, options, txn.as_ref()).await
    }

    // ---- transactions ----

    /// Starts a tablet transaction with the configured lease and makes it the
    /// innermost ambient transaction.
    ///
    /// The caller must commit or abort it; see
    /// [`run_in_transaction`](Self::run_in_transaction) for a scoped form.
    pub async fn start_transaction(&self) -> Result<Transaction, Error> {
        self.start_transaction_with_timeout(self.config().transaction_timeout)
            .await
    }

    pub async fn start_transaction_with_timeout(&self, timeout: Duration) -> Result<Transaction, Error> {
        self.inner.transactions.begin(self, timeout).await
    }

    /// Runs `f` in a new transaction, committing on success and aborting on
    /// failure.
    ///
    /// ```no_run
    /// # use ytclient::{Client, ClientConfig, Row, YPath, LookupOptions};
    /// # async fn example(client: Client) -> Result<(), ytclient::Error> {
    /// let table = YPath::new("//tmp/t")?;
    /// client
    ///     .run_in_transaction(|txn| async move {
    ///         let rows = txn.lookup_rows(&table, &[Row::new().with("x", 0)], LookupOptions::default()).await?;
    ///         if let Some(row) = rows.first() {
    ///             let y = row.get("y").and_then(|v| v.as_i64()).unwrap_or(0);
    ///             txn.insert_rows(&table, vec![Row::new().with("x", 0).with("y", y + 1)]).await?;
    ///         }
    ///         Ok::<_, ytclient::Error>(())
    ///     })
    ///     .await
    /// # }
    /// ```
    pub async fn run_in_transaction<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.inner
            .transactions
            .run(self, self.config().transaction_timeout, f)
            .await
    }

    /// Returns the innermost active ambient transaction.
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.inner.transactions.current()
    }

    // ---- internals ----

    fn remember_schema(&self, path: &YPath, schema: &TableSchema) {
        self.inner.schemas.lock().insert(path.clone(), schema.clone());
    }

    fn forget_schema(&self, path: &YPath) {
        self.inner.schemas.lock().remove(path);
    }

    async fn schema(&self, path: &YPath) -> Result<TableSchema, Error> {
        if let Some(schema) = self.inner.schemas.lock().get(path) {
            return Ok(schema.clone());
        }
        Ok(self.get_table(path).await?.schema)
    }

    fn read_from(&self, preference: Option<ReadFrom>) -> ReadFrom {
        preference.unwrap_or(self.config().read_from)
    }

    #[instrument(skip(self, rows, txn), fields(path = %path, rows = rows.len(), txn = ?txn.map(Transaction::id)))]
    pub(crate) async fn write(
        &self,
        path: &YPath,
        rows: Vec<Row>,
        kind: WriteKind,
        options: InsertOptions,
        txn: Option<&Transaction>,
    ) -> Result<(), Error> {
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        if rows.is_empty() {
            return Ok(());
        }

        let schema = self.schema(path).await?;
        let transaction_id = txn.map(|t| t.id().clone());
        let result = match kind {
            WriteKind::Insert => {
                let batch = if options.update {
                    InsertBatch::Partial(encode_partial_rows(&rows, &schema)?)
                } else {
                    InsertBatch::Full(encode_rows(&rows, &schema, EncodeMode::Write)?)
                };
                self.dispatcher()
                    .execute(&InsertRows {
                        path: path.clone(),
                        rows: batch,
                        aggregate: options.aggregate,
                        transaction_id,
                    })
                    .await
            }
            WriteKind::Delete => {
                let keys = encode_rows(&rows, &schema, EncodeMode::Key)?;
                self.dispatcher()
                    .execute(&DeleteRows {
                        path: path.clone(),
                        keys,
                        transaction_id,
                    })
                    .await
            }
        };

        match (result, txn) {
            (Ok(()), Some(txn)) => {
                txn.record_writes(path, kind, rows);
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(err), txn) => {
                if let Some(txn) = txn {
                    txn.observe(&err);
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self, keys, options, txn), fields(path = %path, keys = keys.len(), txn = ?txn.map(Transaction::id)))]
    pub(crate) async fn lookup(
        &self,
        path: &YPath,
        keys: &[Row],
        options: LookupOptions,
        txn: Option<&Transaction>,
    ) -> Result<Vec<Row>, Error> {
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        let schema = self.schema(path).await?;
        let encoded = encode_rows(keys, &schema, EncodeMode::Key)?;

        let mut seen = HashSet::with_capacity(encoded.len());
        let unique: Vec<UnversionedRow> = encoded
            .into_iter()
            .filter(|key| seen.insert(key_identity(key)))
            .collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let columns = match &options.column_names {
            Some(names) => schema.project(names)?,
            None => schema.columns().to_vec(),
        };
        let command = LookupRows {
            path: path.clone(),
            keys: unique,
            column_names: options.column_names.clone(),
            read_from: self.read_from(options.read_from),
            timestamp: options.timestamp,
            transaction_id: txn.map(|t| t.id().clone()),
        };

        let rows = match self.dispatcher().execute(&command).await {
            Ok(rows) => rows,
            Err(err) => {
                if let Some(txn) = txn {
                    txn.observe(&err);
                }
                return Err(err);
            }
        };
        rows.into_iter()
            .flatten()
            .map(|row| decode_row(row, &columns))
            .collect()
    }

    #[instrument(skip(self, options, txn), fields(txn = ?txn.map(Transaction::id)))]
    pub(crate) async fn select(
        &self,
        query: &str,
        options: SelectOptions,
        txn: Option<&Transaction>,
    ) -> Result<RowStream, Error> {
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        let command = SelectRows {
            query: query.to_string(),
            read_from: self.read_from(options.read_from),
            timestamp: options.timestamp,
            input_row_limit: options.input_row_limit,
            output_row_limit: options.output_row_limit,
            fail_on_incomplete_result: options.fail_on_incomplete_result,
            transaction_id: txn.map(|t| t.id().clone()),
        };
        let output = match self.dispatcher().execute(&command).await {
            Ok(output) => output,
            Err(err) => {
                if let Some(txn) = txn {
                    txn.observe(&err);
                }
                return Err(err);
            }
        };

        let mut stream = output.stream;
        if let Some(stream) = stream.as_mut() {
            stream.set_idle_timeout(self.config().request_timeout);
        }
        Ok(RowStream::new(
            output.columns,
            VecDeque::from(output.rows),
            stream,
        ))
    }
}

impl Transaction {
    /// Writes rows in this transaction.
    pub async fn insert_rows(&self, path: &YPath, rows: Vec<Row>) -> Result<(), Error> {
        self.insert_rows_with_options(path, rows, InsertOptions::default())
            .await
    }

    pub async fn insert_rows_with_options(
        &self,
        path: &YPath,
        rows: Vec<Row>,
        options: InsertOptions,
    ) -> Result<(), Error> {
        self.client()
            .write(path, rows, WriteKind::Insert, options, Some(self))
            .await
    }

    /// Deletes rows by key in this transaction.
    pub async fn delete_rows(&self, path: &YPath, keys: Vec<Row>) -> Result<(), Error> {
        self.client()
            .write(path, keys, WriteKind::Delete, InsertOptions::default(), Some(self))
            .await
    }

    /// Looks rows up in this transaction's snapshot, seeing its own writes.
    pub async fn lookup_rows(
        &self,
        path: &YPath,
        keys: &[Row],
        options: LookupOptions,
    ) -> Result<Vec<Row>, Error> {
        self.client().lookup(path, keys, options, Some(self)).await
    }

    /// Runs a query in this transaction's snapshot, seeing its own writes.
    pub async fn select_rows(&self, query: &str, options: SelectOptions) -> Result<RowStream, Error> {
        self.client().select(query, options, Some(self)).await
    }
}
