// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! In-process fake cluster shared by the integration tests.
//!
//! The cluster speaks either wire over a real socket and keeps tables as
//! versioned rows. Tablet transactions read at their start timestamp, buffer
//! writes until commit and lose to any transaction that committed a write to
//! the same key after they started. Streamed replies honour the client's
//! credit window.

#![allow(dead_code, unused_macros)]

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use ytclient::transport::frame::{frame_codec, Frame, RpcResult};
use ytclient::transport::http_codec::{HttpCodec, HttpMessage};
use ytclient::transport::Params;
use ytclient::{
    AggregateFunction, Backend, Client, ClientConfig, ColumnSchema, ColumnType, CreateOptions,
    ErrorCode, MountState, RetryPolicy, Row, ServiceError, TableSchema, TransactionId,
    UnversionedRow, Value, YPath,
};

/// Runs each listed `async fn(Backend)` once per backend.
macro_rules! on_both_backends {
    ($($name:ident),* $(,)?) => {
        mod http {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(ytclient::Backend::Http).await
                }
            )*
        }

        mod rpc {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(ytclient::Backend::Rpc).await
                }
            )*
        }
    };
}

/// Mount transitions complete after this long unless overridden.
pub const MOUNT_DELAY: Duration = Duration::from_millis(20);

/// Schema `[{x: int64 asc}, {y: int64}]` used by most tests.
pub fn xy_schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnSchema::key("x", ColumnType::Int64),
        ColumnSchema::new("y", ColumnType::Int64),
    ])
    .unwrap()
}

/// Result of a successfully handled command.
enum Reply {
    Body(Option<Json>),
    Rows {
        columns: Vec<ColumnSchema>,
        rows: Vec<UnversionedRow>,
    },
}

fn error(code: ErrorCode, message: impl Into<String>) -> ServiceError {
    ServiceError::new(code, message)
}

fn cmp_value(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
        (Value::Uint64(a), Value::Uint64(b)) => a.cmp(b),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (a, b) => a.type_name().cmp(b.type_name()),
    }
}

fn cmp_key(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(a, b)| cmp_value(a, b))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

#[derive(Debug)]
struct StoredRow {
    key: Vec<Value>,
    /// `(commit timestamp, row)`, oldest first; `None` marks a delete.
    versions: Vec<(u64, Option<Vec<Value>>)>,
}

#[derive(Debug)]
struct Table {
    schema: TableSchema,
    tablet_state: MountState,
    transition: Option<(MountState, Instant)>,
    rows: Vec<StoredRow>,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            tablet_state: MountState::Unmounted,
            transition: None,
            rows: Vec::new(),
        }
    }

    fn settle(&mut self) {
        if let Some((target, at)) = self.transition {
            if Instant::now() >= at {
                self.tablet_state = target;
                self.transition = None;
            }
        }
    }

    fn ensure_mounted(&mut self, path: &str) -> Result<(), ServiceError> {
        self.settle();
        if self.tablet_state != MountState::Mounted {
            return Err(error(
                ErrorCode::TABLET_NOT_MOUNTED,
                format!("table {} is not mounted", path),
            ));
        }
        Ok(())
    }

    fn key_of(&self, row: &[Value]) -> Vec<Value> {
        row[..self.schema.key_column_count().min(row.len())].to_vec()
    }

    fn read(&self, key: &[Value], snapshot: Option<u64>) -> Option<Vec<Value>> {
        let stored = self.rows.iter().find(|r| r.key == key)?;
        stored
            .versions
            .iter()
            .rev()
            .find(|(ts, _)| snapshot.map_or(true, |s| *ts <= s))
            .and_then(|(_, row)| row.clone())
    }

    fn last_commit(&self, key: &[Value]) -> u64 {
        self.rows
            .iter()
            .find(|r| r.key == key)
            .and_then(|r| r.versions.last())
            .map_or(0, |(ts, _)| *ts)
    }

    fn apply(&mut self, key: Vec<Value>, row: Option<Vec<Value>>, ts: u64) {
        match self.rows.iter_mut().find(|r| r.key == key) {
            Some(stored) => stored.versions.push((ts, row)),
            None => self.rows.push(StoredRow {
                key,
                versions: vec![(ts, row)],
            }),
        }
    }

    /// The row as `txn` sees it, or as of `snapshot` outside a transaction.
    fn current(
        &self,
        path: &str,
        key: &[Value],
        txn: Option<&Txn>,
        snapshot: Option<u64>,
    ) -> Option<Vec<Value>> {
        match txn.and_then(|t| t.own_write(path, key)) {
            Some(own) => own.clone(),
            None => self.read(key, txn.map(|t| t.start_ts).or(snapshot)),
        }
    }

    /// Builds a full row from a name-keyed one, keeping unnamed columns of `base`.
    fn merge_partial(&self, row: &Row, base: Option<&[Value]>) -> Result<Vec<Value>, ServiceError> {
        for name in row.columns() {
            if self.schema.position(name).is_none() {
                return Err(error(ErrorCode(1), format!("no such column {:?}", name)));
            }
        }
        self.schema
            .columns()
            .iter()
            .enumerate()
            .map(|(i, column)| match row.get(&column.name) {
                Some(value) => Ok(value.clone()),
                None if column.sort_order.is_some() => Err(error(
                    ErrorCode(1),
                    format!("missing key column {:?}", column.name),
                )),
                None => Ok(base.map_or(Value::Null, |base| base[i].clone())),
            })
            .collect()
    }

    /// Folds the stored values of aggregate columns into `row`.
    fn aggregate(&self, mut row: Vec<Value>, base: Option<&[Value]>) -> Vec<Value> {
        let Some(base) = base else { return row };
        for (i, column) in self.schema.columns().iter().enumerate() {
            if let Some(function) = column.aggregate {
                let new = std::mem::replace(&mut row[i], Value::Null);
                row[i] = combine(function, &base[i], new);
            }
        }
        row
    }

    fn visible(&self, snapshot: Option<u64>) -> Vec<(Vec<Value>, Vec<Value>)> {
        self.rows
            .iter()
            .filter_map(|r| self.read(&r.key, snapshot).map(|row| (r.key.clone(), row)))
            .collect()
    }

    fn projection(&self, names: Option<&[String]>) -> Result<Vec<usize>, ServiceError> {
        match names {
            None => Ok((0..self.schema.columns().len()).collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.schema.position(name).ok_or_else(|| {
                        error(ErrorCode(1), format!("no such column {:?}", name))
                    })
                })
                .collect(),
        }
    }
}

fn combine(function: AggregateFunction, old: &Value, new: Value) -> Value {
    use AggregateFunction::*;
    match (old, new) {
        (Value::Null, new) => new,
        (old, Value::Null) => old.clone(),
        (Value::Int64(a), Value::Int64(b)) => Value::Int64(match function {
            Sum => a + b,
            Min => (*a).min(b),
            Max => (*a).max(b),
        }),
        (Value::Uint64(a), Value::Uint64(b)) => Value::Uint64(match function {
            Sum => a + b,
            Min => (*a).min(b),
            Max => (*a).max(b),
        }),
        (Value::Double(a), Value::Double(b)) => Value::Double(match function {
            Sum => a + b,
            Min => a.min(b),
            Max => a.max(b),
        }),
        (_, new) => new,
    }
}

#[derive(Debug)]
struct Write {
    table: String,
    key: Vec<Value>,
    row: Option<Vec<Value>>,
}

#[derive(Debug)]
struct Txn {
    start_ts: u64,
    lease: Duration,
    expires_at: Instant,
    writes: Vec<Write>,
}

impl Txn {
    fn own_write(&self, table: &str, key: &[Value]) -> Option<&Option<Vec<Value>>> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.table == table && w.key == key)
            .map(|w| &w.row)
    }
}

#[derive(Debug)]
struct State {
    tables: HashMap<String, Table>,
    transactions: HashMap<TransactionId, Txn>,
    clock: u64,
    faults: VecDeque<ErrorCode>,
    requests: HashMap<String, usize>,
    cancels: usize,
    mount_delay: Option<Duration>,
    chunk_rows: usize,
    chunk_delay: Duration,
    chunks_sent: usize,
    stalls: HashMap<String, Duration>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            transactions: HashMap::new(),
            clock: 1,
            faults: VecDeque::new(),
            requests: HashMap::new(),
            cancels: 0,
            mount_delay: Some(MOUNT_DELAY),
            chunk_rows: 2,
            chunk_delay: Duration::ZERO,
            chunks_sent: 0,
            stalls: HashMap::new(),
        }
    }
}

fn str_param<'a>(params: &'a Params, name: &str) -> Result<&'a str, ServiceError> {
    params
        .get(name)
        .and_then(Json::as_str)
        .ok_or_else(|| error(ErrorCode(1), format!("missing parameter {:?}", name)))
}

fn bool_param(params: &Params, name: &str) -> bool {
    params.get(name).and_then(Json::as_bool).unwrap_or(false)
}

fn u64_param(params: &Params, name: &str) -> Option<u64> {
    params.get(name).and_then(Json::as_u64)
}

fn rows_body(body: Option<Json>) -> Result<Vec<UnversionedRow>, ServiceError> {
    serde_json::from_value(body.unwrap_or(Json::Null))
        .map_err(|e| error(ErrorCode(1), format!("malformed rows: {}", e)))
}

/// Splits `<columns> from [<path>]`.
fn parse_query(query: &str) -> Result<(Option<Vec<String>>, String), ServiceError> {
    let bad = || error(ErrorCode(1), format!("cannot parse query {:?}", query));
    let from = query.to_ascii_lowercase().find(" from ").ok_or_else(bad)?;
    let selection = query[..from].trim();
    let path = query[from + 6..]
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(path, _)| path.trim().to_string())
        .ok_or_else(bad)?;
    let columns = match selection {
        "*" => None,
        list => Some(list.split(',').map(|c| c.trim().to_string()).collect()),
    };
    Ok((columns, path))
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn expire_leases(&mut self) {
        let now = Instant::now();
        self.transactions.retain(|_, txn| txn.expires_at > now);
    }

    fn handle(
        &mut self,
        method: &str,
        params: &Params,
        body: Option<Json>,
        txn: Option<TransactionId>,
    ) -> Result<Reply, ServiceError> {
        *self.requests.entry(method.to_string()).or_default() += 1;
        if let Some(code) = self.faults.pop_front() {
            return Err(error(code, "injected failure"));
        }
        self.expire_leases();

        match method {
            "create" => self.create(params),
            "remove" => self.remove(params),
            "exists" => {
                let path = str_param(params, "path")?;
                Ok(Reply::Body(Some(json!({ "value": self.tables.contains_key(path) }))))
            }
            "get" => self.get(params),
            "mount_table" => self.transition(params, MountState::Mounting, MountState::Mounted),
            "unmount_table" => {
                self.transition(params, MountState::Unmounting, MountState::Unmounted)
            }
            "remount_table" => {
                let path = str_param(params, "path")?;
                self.table_mut(path)?.ensure_mounted(path)?;
                Ok(Reply::Body(None))
            }
            "insert_rows" => self.write(params, body, txn, false),
            "delete_rows" => self.write(params, body, txn, true),
            "lookup_rows" => self.lookup(params, body, txn),
            "select_rows" => self.select(params, txn),
            "start_transaction" => {
                let lease = params
                    .get("timeout")
                    .and_then(Json::as_u64)
                    .map_or(Duration::from_secs(15), Duration::from_millis);
                let start_ts = self.tick();
                let id = TransactionId::new(uuid::Uuid::new_v4().to_string());
                self.transactions.insert(
                    id.clone(),
                    Txn {
                        start_ts,
                        lease,
                        expires_at: Instant::now() + lease,
                        writes: Vec::new(),
                    },
                );
                Ok(Reply::Body(Some(
                    json!({ "transaction_id": id, "start_timestamp": start_ts }),
                )))
            }
            "commit_transaction" => self.commit(txn),
            "abort_transaction" => {
                self.take_txn(txn)?;
                Ok(Reply::Body(None))
            }
            "ping_transaction" => {
                let id = txn.ok_or_else(|| error(ErrorCode(1), "transaction id required"))?;
                let txn = self.transactions.get_mut(&id).ok_or_else(|| no_such_txn(&id))?;
                txn.expires_at = Instant::now() + txn.lease;
                Ok(Reply::Body(None))
            }
            other => Err(error(ErrorCode(1), format!("unknown command {}", other))),
        }
    }

    fn table_mut(&mut self, path: &str) -> Result<&mut Table, ServiceError> {
        self.tables.get_mut(path).ok_or_else(|| {
            error(
                ErrorCode::RESOLVE_ERROR,
                format!("node {} does not exist", path),
            )
        })
    }

    fn take_txn(&mut self, txn: Option<TransactionId>) -> Result<Txn, ServiceError> {
        let id = txn.ok_or_else(|| error(ErrorCode(1), "transaction id required"))?;
        self.transactions.remove(&id).ok_or_else(|| no_such_txn(&id))
    }

    fn create(&mut self, params: &Params) -> Result<Reply, ServiceError> {
        let path = str_param(params, "path")?.to_string();
        if str_param(params, "type")? != "table" {
            return Err(error(ErrorCode(1), "only tables can be created"));
        }
        let schema: TableSchema = params
            .get("attributes")
            .and_then(|a| a.get("schema"))
            .cloned()
            .ok_or_else(|| error(ErrorCode(1), "schema attribute required"))
            .and_then(|s| {
                serde_json::from_value(s).map_err(|e| error(ErrorCode(1), e.to_string()))
            })?;

        if self.tables.contains_key(&path) {
            if bool_param(params, "ignore_existing") {
                return Ok(Reply::Body(None));
            }
            if !bool_param(params, "force") {
                return Err(error(
                    ErrorCode::ALREADY_EXISTS,
                    format!("node {} already exists", path),
                ));
            }
        }
        self.tables.insert(path, Table::new(schema));
        Ok(Reply::Body(None))
    }

    fn remove(&mut self, params: &Params) -> Result<Reply, ServiceError> {
        let path = str_param(params, "path")?;
        if self.tables.remove(path).is_none() && !bool_param(params, "force") {
            return Err(error(
                ErrorCode::RESOLVE_ERROR,
                format!("node {} does not exist", path),
            ));
        }
        Ok(Reply::Body(None))
    }

    fn get(&mut self, params: &Params) -> Result<Reply, ServiceError> {
        let full = str_param(params, "path")?;
        let (path, attribute) = match full.split_once("/@") {
            Some((path, attribute)) => (path, attribute),
            None => (full, ""),
        };
        let table = self.table_mut(path)?;
        table.settle();
        let value = match attribute {
            "" => json!({ "schema": table.schema, "tablet_state": table.tablet_state }),
            "tablet_state" => json!(table.tablet_state),
            "schema" => json!(table.schema),
            other => {
                return Err(error(
                    ErrorCode::RESOLVE_ERROR,
                    format!("attribute {:?} is not found", other),
                ))
            }
        };
        Ok(Reply::Body(Some(json!({ "value": value }))))
    }

    fn transition(
        &mut self,
        params: &Params,
        during: MountState,
        target: MountState,
    ) -> Result<Reply, ServiceError> {
        let delay = self.mount_delay;
        let table = self.table_mut(str_param(params, "path")?)?;
        table.settle();
        if table.tablet_state == target {
            return Ok(Reply::Body(None));
        }
        match delay {
            Some(delay) if delay.is_zero() => {
                table.tablet_state = target;
                table.transition = None;
            }
            Some(delay) => {
                table.tablet_state = during;
                table.transition = Some((target, Instant::now() + delay));
            }
            None => {
                table.tablet_state = during;
                table.transition = None;
            }
        }
        Ok(Reply::Body(None))
    }

    fn write(
        &mut self,
        params: &Params,
        body: Option<Json>,
        txn: Option<TransactionId>,
        delete: bool,
    ) -> Result<Reply, ServiceError> {
        let path = str_param(params, "path")?.to_string();
        let update = bool_param(params, "update");
        let aggregate = bool_param(params, "aggregate");
        let txn_view = match &txn {
            Some(id) => Some(self.transactions.get(id).ok_or_else(|| no_such_txn(id))?),
            None => None,
        };

        let table = self.tables.get_mut(&path).ok_or_else(|| {
            error(ErrorCode::RESOLVE_ERROR, format!("node {} does not exist", path))
        })?;
        table.ensure_mounted(&path)?;

        let full_rows = if update {
            let partial: Vec<Row> = serde_json::from_value(body.unwrap_or(Json::Null))
                .map_err(|e| error(ErrorCode(1), format!("malformed rows: {}", e)))?;
            partial
                .iter()
                .map(|row| {
                    let key: Vec<Value> = table
                        .schema
                        .key_columns()
                        .iter()
                        .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null))
                        .collect();
                    let base = table.current(&path, &key, txn_view, None);
                    table.merge_partial(row, base.as_deref())
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let width = if delete {
                table.schema.key_column_count()
            } else {
                table.schema.columns().len()
            };
            let rows = rows_body(body)?;
            if let Some(row) = rows.iter().find(|row| row.len() != width) {
                return Err(error(
                    ErrorCode(1),
                    format!("row has {} values, expected {}", row.len(), width),
                ));
            }
            rows.into_iter().map(|row| row.0).collect()
        };

        let mut writes = Vec::with_capacity(full_rows.len());
        for row in full_rows {
            let key = table.key_of(&row);
            let row = if delete {
                None
            } else if aggregate {
                let base = table.current(&path, &key, txn_view, None);
                Some(table.aggregate(row, base.as_deref()))
            } else {
                Some(row)
            };
            writes.push(Write {
                table: path.clone(),
                key,
                row,
            });
        }

        match txn {
            Some(id) => {
                if let Some(txn) = self.transactions.get_mut(&id) {
                    txn.writes.extend(writes);
                }
            }
            None => {
                let ts = self.tick();
                if let Some(table) = self.tables.get_mut(&path) {
                    for write in writes {
                        table.apply(write.key, write.row, ts);
                    }
                }
            }
        }
        Ok(Reply::Body(None))
    }

    fn lookup(
        &mut self,
        params: &Params,
        body: Option<Json>,
        txn: Option<TransactionId>,
    ) -> Result<Reply, ServiceError> {
        let path = str_param(params, "path")?.to_string();
        let keys = rows_body(body)?;
        let columns: Option<Vec<String>> = params
            .get("column_names")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| error(ErrorCode(1), e.to_string()))?;
        let txn = match &txn {
            Some(id) => Some(self.transactions.get(id).ok_or_else(|| no_such_txn(id))?),
            None => None,
        };

        let table = self.tables.get_mut(&path).ok_or_else(|| {
            error(ErrorCode::RESOLVE_ERROR, format!("node {} does not exist", path))
        })?;
        table.ensure_mounted(&path)?;
        let projection = table.projection(columns.as_deref())?;
        let snapshot = u64_param(params, "timestamp");

        let rows: Vec<Option<UnversionedRow>> = keys
            .iter()
            .map(|key| {
                let row = table.current(&path, &key.0, txn, snapshot);
                row.map(|row| UnversionedRow(projection.iter().map(|&i| row[i].clone()).collect()))
            })
            .collect();
        Ok(Reply::Body(Some(json!({ "rows": rows }))))
    }

    fn select(&mut self, params: &Params, txn: Option<TransactionId>) -> Result<Reply, ServiceError> {
        let (columns, path) = parse_query(str_param(params, "query")?)?;
        let txn = match &txn {
            Some(id) => Some(self.transactions.get(id).ok_or_else(|| no_such_txn(id))?),
            None => None,
        };
        let table = self.tables.get_mut(&path).ok_or_else(|| {
            error(ErrorCode::RESOLVE_ERROR, format!("node {} does not exist", path))
        })?;
        table.ensure_mounted(&path)?;
        let projection = table.projection(columns.as_deref())?;

        let snapshot = txn.map(|t| t.start_ts).or(u64_param(params, "timestamp"));
        let mut visible = table.visible(snapshot);
        if let Some(txn) = txn {
            for write in txn.writes.iter().filter(|w| w.table == path) {
                visible.retain(|(key, _)| *key != write.key);
                if let Some(row) = &write.row {
                    visible.push((write.key.clone(), row.clone()));
                }
            }
        }
        visible.sort_by(|a, b| cmp_key(&a.0, &b.0));

        let fail_on_incomplete = params
            .get("fail_on_incomplete_result")
            .and_then(Json::as_bool)
            .unwrap_or(true);
        for (limit, what) in [("input_row_limit", "input"), ("output_row_limit", "output")] {
            let Some(limit) = u64_param(params, limit) else { continue };
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            if visible.len() > limit {
                if fail_on_incomplete {
                    return Err(error(
                        ErrorCode(1),
                        format!("query terminated prematurely due to excessive {}", what),
                    ));
                }
                visible.truncate(limit);
            }
        }

        let schema_columns = projection
            .iter()
            .map(|&i| table.schema.columns()[i].clone())
            .collect();
        let rows = visible
            .into_iter()
            .map(|(_, row)| UnversionedRow(projection.iter().map(|&i| row[i].clone()).collect()))
            .collect();
        Ok(Reply::Rows {
            columns: schema_columns,
            rows,
        })
    }

    fn commit(&mut self, txn: Option<TransactionId>) -> Result<Reply, ServiceError> {
        let id = txn.clone();
        let txn = self.take_txn(txn)?;
        for write in &txn.writes {
            let conflict = self
                .tables
                .get(&write.table)
                .is_some_and(|t| t.last_commit(&write.key) > txn.start_ts);
            if conflict {
                return Err(error(ErrorCode(1), "commit failed").with_inner(error(
                    ErrorCode::TRANSACTION_LOCK_CONFLICT,
                    format!(
                        "row lock conflict in {} for transaction {}",
                        write.table,
                        id.as_ref().map(TransactionId::as_str).unwrap_or_default()
                    ),
                )));
            }
        }
        let ts = self.tick();
        for write in txn.writes {
            if let Some(table) = self.tables.get_mut(&write.table) {
                table.apply(write.key, write.row, ts);
            }
        }
        Ok(Reply::Body(None))
    }
}

fn no_such_txn(id: &TransactionId) -> ServiceError {
    error(
        ErrorCode::NO_SUCH_TRANSACTION,
        format!("no such transaction {}", id),
    )
}

/// A running fake cluster.
pub struct FakeCluster {
    backend: Backend,
    address: String,
    state: Arc<Mutex<State>>,
    accept: JoinHandle<()>,
}

impl FakeCluster {
    pub async fn start(backend: Backend) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(State::default()));

        let shared = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = stream.set_nodelay(true);
                let state = shared.clone();
                match backend {
                    Backend::Http => tokio::spawn(serve_http(stream, state)),
                    Backend::Rpc => tokio::spawn(serve_rpc(stream, state)),
                };
            }
        });

        Self {
            backend,
            address,
            state,
            accept,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Configuration with short timeouts and fast retries.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.address.clone())
            .with_backend(self.backend)
            .with_request_timeout(Duration::from_secs(5))
            .with_retry_policy(RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                jitter: 0.1,
            })
            .with_mount_wait_timeout(Duration::from_secs(2))
            .with_tablet_state_poll_interval(Duration::from_millis(5))
    }

    pub fn client(&self) -> Client {
        Client::new(self.config()).unwrap()
    }

    /// Makes the next `n` requests fail with `code`.
    pub fn fail_next(&self, n: usize, code: ErrorCode) {
        self.state.lock().faults.extend(std::iter::repeat(code).take(n));
    }

    /// Number of requests received for `command`.
    pub fn requests(&self, command: &str) -> usize {
        self.state.lock().requests.get(command).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state.lock().requests.values().sum()
    }

    /// Number of `Cancel` frames received.
    pub fn cancels(&self) -> usize {
        self.state.lock().cancels
    }

    /// `None` leaves tables mounting forever.
    pub fn set_mount_delay(&self, delay: Option<Duration>) {
        self.state.lock().mount_delay = delay;
    }

    /// Streams query results `rows` at a time with `delay` before each chunk.
    pub fn set_stream_pacing(&self, rows: usize, delay: Duration) {
        let mut state = self.state.lock();
        state.chunk_rows = rows.max(1);
        state.chunk_delay = delay;
    }

    /// Number of stream chunks sent so far.
    pub fn chunks_sent(&self) -> usize {
        self.state.lock().chunks_sent
    }

    /// Delays every reply to `command` by `delay`. The command takes effect
    /// before the delay.
    pub fn stall(&self, command: &str, delay: Duration) {
        self.state.lock().stalls.insert(command.to_string(), delay);
    }

    /// Forgets every open transaction, as if all leases ran out.
    pub fn expire_transactions(&self) {
        self.state.lock().transactions.clear();
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }
}

impl Drop for FakeCluster {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve_http(stream: TcpStream, state: Arc<Mutex<State>>) {
    let mut framed = Framed::new(stream, HttpCodec::new());
    while let Some(Ok(request)) = framed.next().await {
        let reply = match request.method_and_target() {
            Some(("POST", target)) if target.starts_with("/api/v4/") => {
                let method = target.trim_start_matches("/api/v4/").to_string();
                let params: Params = request
                    .header("X-YT-Parameters")
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_default();
                let txn = params
                    .get("transaction_id")
                    .and_then(Json::as_str)
                    .map(TransactionId::new);
                let body = if request.body.is_empty() {
                    None
                } else {
                    serde_json::from_slice(&request.body).ok()
                };
                let (result, stall) = {
                    let mut state = state.lock();
                    let result = state.handle(&method, &params, body, txn);
                    (result, state.stalls.get(&method).copied())
                };
                if let Some(delay) = stall {
                    tokio::time::sleep(delay).await;
                }
                http_reply(result)
            }
            _ => HttpMessage::response(404, "Not Found"),
        };
        if framed.send(reply).await.is_err() {
            return;
        }
    }
}

fn http_reply(result: Result<Reply, ServiceError>) -> HttpMessage {
    let ok = HttpMessage::response(200, "OK").with_header("Content-Type", "application/json");
    match result {
        Ok(Reply::Body(None)) => ok,
        Ok(Reply::Body(Some(body))) => ok.with_body(body.to_string()),
        Ok(Reply::Rows { columns, rows }) => {
            ok.with_body(json!({ "schema": columns, "rows": rows }).to_string())
        }
        // Row-level rejections travel in headers, the rest as error bodies.
        Err(err) if err.code == ErrorCode::TABLET_NOT_MOUNTED => ok
            .with_header("X-YT-Response-Code", err.code.0.to_string())
            .with_header("X-YT-Error", serde_json::to_string(&err).unwrap()),
        Err(err) if err.code == ErrorCode::UNAVAILABLE => {
            HttpMessage::response(503, "Service Unavailable")
                .with_body(serde_json::to_string(&err).unwrap())
        }
        Err(err) => HttpMessage::response(400, "Bad Request")
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_string(&err).unwrap()),
    }
}

async fn serve_rpc(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (mut sink, mut source) = Framed::new(stream, frame_codec()).split::<Bytes>();
    let (outbound, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(bytes) = frame.encode() else { continue };
            if sink.send(bytes).await.is_err() {
                return;
            }
        }
    });
    let cancelled = Arc::new(Mutex::new(HashSet::new()));
    let credits: Arc<Mutex<HashMap<u64, Arc<Semaphore>>>> = Arc::default();

    while let Some(Ok(buf)) = source.next().await {
        match Frame::decode(&buf) {
            Ok(Frame::Request {
                request_id,
                method,
                params,
                body,
                transaction_id,
                streaming,
                window,
                ..
            }) => {
                let (result, stall) = {
                    let mut state = state.lock();
                    let result = state.handle(&method, &params, body, transaction_id);
                    (result, state.stalls.get(&method).copied())
                };
                let result = match result {
                    Ok(Reply::Rows { columns, rows }) if streaming => {
                        let (chunk_rows, delay) = {
                            let state = state.lock();
                            (state.chunk_rows, state.chunk_delay)
                        };
                        let window = window.map_or(Semaphore::MAX_PERMITS, |w| w as usize);
                        let permits = Arc::new(Semaphore::new(window));
                        credits.lock().insert(request_id, permits.clone());
                        tokio::spawn(stream_rows(
                            request_id,
                            columns,
                            rows,
                            chunk_rows,
                            delay,
                            permits,
                            outbound.clone(),
                            cancelled.clone(),
                            state.clone(),
                        ));
                        continue;
                    }
                    Ok(Reply::Rows { columns, rows }) => {
                        RpcResult::Ok(Some(json!({ "schema": columns, "rows": rows })))
                    }
                    Ok(Reply::Body(body)) => RpcResult::Ok(body),
                    Err(err) => RpcResult::Error(err),
                };
                let reply = Frame::Response { request_id, result };
                match stall {
                    Some(delay) => {
                        let outbound = outbound.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = outbound.send(reply);
                        });
                    }
                    None => {
                        let _ = outbound.send(reply);
                    }
                }
            }
            Ok(Frame::Credit { request_id, chunks }) => {
                if let Some(permits) = credits.lock().get(&request_id) {
                    permits.add_permits(chunks as usize);
                }
            }
            Ok(Frame::Cancel { request_id }) => {
                cancelled.lock().insert(request_id);
                if let Some(permits) = credits.lock().remove(&request_id) {
                    permits.close();
                }
                state.lock().cancels += 1;
            }
            _ => {}
        }
    }
    writer.abort();
}

async fn stream_rows(
    request_id: u64,
    columns: Vec<ColumnSchema>,
    rows: Vec<UnversionedRow>,
    chunk_rows: usize,
    delay: Duration,
    permits: Arc<Semaphore>,
    outbound: mpsc::UnboundedSender<Frame>,
    cancelled: Arc<Mutex<HashSet<u64>>>,
    state: Arc<Mutex<State>>,
) {
    let header = Frame::Response {
        request_id,
        result: RpcResult::Ok(Some(json!({ "schema": columns }))),
    };
    if outbound.send(header).is_err() {
        return;
    }
    for chunk in rows.chunks(chunk_rows) {
        match permits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if cancelled.lock().contains(&request_id) {
            return;
        }
        let rows = chunk
            .iter()
            .map(|row| serde_json::to_value(row).unwrap())
            .collect();
        if outbound.send(Frame::StreamChunk { request_id, rows }).is_err() {
            return;
        }
        state.lock().chunks_sent += 1;
    }
    let _ = outbound.send(Frame::StreamEnd {
        request_id,
        error: None,
    });
}

/// Starts a cluster and a client with a mounted `//tmp/t` of [`xy_schema`].
pub async fn mounted_table(backend: Backend) -> (FakeCluster, Client, YPath) {
    let cluster = FakeCluster::start(backend).await;
    let client = cluster.client();
    let path = YPath::new("//tmp/t").unwrap();
    client
        .create_table(&path, xy_schema(), CreateOptions::default())
        .await
        .unwrap();
    client.mount_table(&path, true).await.unwrap();
    (cluster, client, path)
}

pub fn xy(x: i64, y: i64) -> Row {
    Row::new().with("x", x).with("y", y)
}

pub fn key(x: i64) -> Row {
    Row::new().with("x", x)
}

/// Values of column `x`, in row order.
pub fn xs(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|row| row.get("x").and_then(Value::as_i64).unwrap())
        .collect()
}

/// Waits up to a second for `condition` to hold.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A listener that accepts connections and never answers.
pub struct Unresponsive {
    pub address: String,
    task: JoinHandle<()>,
}

impl Unresponsive {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Self { address, task }
    }
}

impl Drop for Unresponsive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
