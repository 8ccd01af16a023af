// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Typed command descriptions.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::Command;
use crate::client::ReadFrom;
use crate::codec::UnversionedRow;
use crate::error::{ErrorCode, Error, TransportError};
use crate::path::YPath;
use crate::schema::{ColumnSchema, Row, TableSchema};
use crate::txn::TransactionId;
use crate::transport::{ChunkStream, Params, Response};

/// Mount state of a table's tablets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounted,
    Mounting,
    Unmounting,
}

impl MountState {
    pub fn as_str(self) -> &'static str {
        match self {
            MountState::Unmounted => "unmounted",
            MountState::Mounted => "mounted",
            MountState::Mounting => "mounting",
            MountState::Unmounting => "unmounting",
        }
    }
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn params<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn protocol(command: &str, message: impl std::fmt::Display) -> Error {
    TransportError::protocol(format!("{}: {}", command, message)).into()
}

/// Extracts and deserializes one field of a response body.
fn field<T: DeserializeOwned>(command: &str, body: Option<serde_json::Value>, name: &str) -> Result<T, Error> {
    let mut body = match body {
        Some(serde_json::Value::Object(map)) => map,
        other => return Err(protocol(command, format!("expected an object body, got {:?}", other))),
    };
    let value = body
        .remove(name)
        .ok_or_else(|| protocol(command, format!("response lacks {:?}", name)))?;
    serde_json::from_value(value).map_err(|e| protocol(command, format!("bad {:?}: {}", name, e)))
}

fn rows_json(rows: &[UnversionedRow]) -> Option<serde_json::Value> {
    serde_json::to_value(rows).ok()
}

/// Creates a dynamic table.
#[derive(Debug, Clone)]
pub struct CreateTable {
    pub path: YPath,
    pub schema: TableSchema,
    /// Replace any existing node at `path` in the same operation.
    pub force: bool,
    /// Succeed without changes if the node already exists.
    pub ignore_existing: bool,
}

impl Command for CreateTable {
    type Output = ();
    const NAME: &'static str = "create";

    fn is_idempotent(&self) -> bool {
        self.ignore_existing
    }

    fn validate(&self) -> Result<(), Error> {
        if self.force && self.ignore_existing {
            return Err(Error::InvalidArgument(
                "force and ignore_existing are mutually exclusive".into(),
            ));
        }
        if !self.schema.is_sorted() {
            return Err(Error::InvalidArgument(
                "a dynamic table needs at least one key column".into(),
            ));
        }
        Ok(())
    }

    fn params(&self) -> Params {
        params([
            ("path", self.path.as_str().into()),
            ("type", "table".into()),
            ("force", self.force.into()),
            ("ignore_existing", self.ignore_existing.into()),
            (
                "attributes",
                serde_json::json!({ "dynamic": true, "schema": self.schema }),
            ),
        ])
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Removes a node.
#[derive(Debug, Clone)]
pub struct RemoveNode {
    pub path: YPath,
    /// Succeed if the node does not exist.
    pub force: bool,
}

impl Command for RemoveNode {
    type Output = ();
    const NAME: &'static str = "remove";

    fn is_idempotent(&self) -> bool {
        self.force
    }

    fn params(&self) -> Params {
        params([
            ("path", self.path.as_str().into()),
            ("force", self.force.into()),
        ])
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Checks whether a node exists.
#[derive(Debug, Clone)]
pub struct NodeExists {
    pub path: YPath,
}

impl Command for NodeExists {
    type Output = bool;
    const NAME: &'static str = "exists";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        params([("path", self.path.as_str().into())])
    }

    fn parse_response(&self, response: Response) -> Result<bool, Error> {
        field(Self::NAME, response.body, "value")
    }
}

/// Attributes needed to open a table handle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableAttributes {
    pub schema: TableSchema,
    pub tablet_state: MountState,
}

/// Fetches the `schema` and `tablet_state` attributes of a table.
#[derive(Debug, Clone)]
pub struct GetTableAttributes {
    pub path: YPath,
}

impl Command for GetTableAttributes {
    type Output = TableAttributes;
    const NAME: &'static str = "get";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        params([
            ("path", format!("{}/@", self.path).into()),
            ("attributes", serde_json::json!(["schema", "tablet_state"])),
        ])
    }

    fn parse_response(&self, response: Response) -> Result<TableAttributes, Error> {
        field(Self::NAME, response.body, "value")
    }
}

/// Reads the aggregate tablet state of a table.
#[derive(Debug, Clone)]
pub struct GetTabletState {
    pub path: YPath,
}

impl Command for GetTabletState {
    type Output = MountState;
    const NAME: &'static str = "get";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        params([("path", self.path.attribute("tablet_state").into())])
    }

    fn parse_response(&self, response: Response) -> Result<MountState, Error> {
        field(Self::NAME, response.body, "value")
    }
}

/// Brings a table's tablets online.
#[derive(Debug, Clone)]
pub struct MountTable {
    pub path: YPath,
}

impl Command for MountTable {
    type Output = ();
    const NAME: &'static str = "mount_table";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        params([("path", self.path.as_str().into())])
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Takes a table's tablets offline.
#[derive(Debug, Clone)]
pub struct UnmountTable {
    pub path: YPath,
}

impl Command for UnmountTable {
    type Output = ();
    const NAME: &'static str = "unmount_table";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        params([("path", self.path.as_str().into())])
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Applies changed mount settings to a mounted table's tablets.
#[derive(Debug, Clone)]
pub struct RemountTable {
    pub path: YPath,
}

impl Command for RemountTable {
    type Output = ();
    const NAME: &'static str = "remount_table";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        params([("path", self.path.as_str().into())])
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Rows of one insert batch.
#[derive(Debug, Clone)]
pub enum InsertBatch {
    /// Positional rows covering every column.
    Full(Vec<UnversionedRow>),
    /// Name-keyed rows; columns they leave out keep their stored values.
    Partial(Vec<Row>),
}

impl InsertBatch {
    pub fn len(&self) -> usize {
        match self {
            InsertBatch::Full(rows) => rows.len(),
            InsertBatch::Partial(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes rows as one batch.
#[derive(Debug, Clone)]
pub struct InsertRows {
    pub path: YPath,
    pub rows: InsertBatch,
    /// Merge written values into aggregate columns instead of replacing them.
    pub aggregate: bool,
    pub transaction_id: Option<TransactionId>,
}

impl Command for InsertRows {
    type Output = ();
    const NAME: &'static str = "insert_rows";

    fn is_idempotent(&self) -> bool {
        false
    }

    fn params(&self) -> Params {
        let mut params = params([("path", self.path.as_str().into())]);
        if matches!(self.rows, InsertBatch::Partial(_)) {
            params.insert("update".into(), true.into());
        }
        if self.aggregate {
            params.insert("aggregate".into(), true.into());
        }
        params
    }

    fn body(&self) -> Option<serde_json::Value> {
        match &self.rows {
            InsertBatch::Full(rows) => rows_json(rows),
            InsertBatch::Partial(rows) => serde_json::to_value(rows).ok(),
        }
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Deletes rows by key as one batch.
#[derive(Debug, Clone)]
pub struct DeleteRows {
    pub path: YPath,
    pub keys: Vec<UnversionedRow>,
    pub transaction_id: Option<TransactionId>,
}

impl Command for DeleteRows {
    type Output = ();
    const NAME: &'static str = "delete_rows";

    fn is_idempotent(&self) -> bool {
        false
    }

    fn params(&self) -> Params {
        params([("path", self.path.as_str().into())])
    }

    fn body(&self) -> Option<serde_json::Value> {
        rows_json(&self.keys)
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Point lookup by key.
///
/// Missing rows are kept as `None` so the result aligns with `keys`.
#[derive(Debug, Clone)]
pub struct LookupRows {
    pub path: YPath,
    pub keys: Vec<UnversionedRow>,
    pub column_names: Option<Vec<String>>,
    pub read_from: ReadFrom,
    /// Read the table as of this timestamp instead of the latest state.
    pub timestamp: Option<u64>,
    pub transaction_id: Option<TransactionId>,
}

fn check_timestamp(timestamp: Option<u64>, transaction_id: Option<&TransactionId>) -> Result<(), Error> {
    if timestamp.is_some() && transaction_id.is_some() {
        return Err(Error::InvalidArgument(
            "a read timestamp cannot be combined with a transaction".into(),
        ));
    }
    Ok(())
}

impl Command for LookupRows {
    type Output = Vec<Option<UnversionedRow>>;
    const NAME: &'static str = "lookup_rows";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<(), Error> {
        if matches!(&self.column_names, Some(names) if names.is_empty()) {
            return Err(Error::InvalidArgument("column_names must not be empty".into()));
        }
        check_timestamp(self.timestamp, self.transaction_id.as_ref())
    }

    fn params(&self) -> Params {
        let mut params = params([
            ("path", self.path.as_str().into()),
            ("keep_missing_rows", true.into()),
            ("read_from", self.read_from.as_str().into()),
        ]);
        if let Some(names) = &self.column_names {
            params.insert("column_names".into(), serde_json::json!(names));
        }
        if let Some(timestamp) = self.timestamp {
            params.insert("timestamp".into(), timestamp.into());
        }
        params
    }

    fn body(&self) -> Option<serde_json::Value> {
        rows_json(&self.keys)
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    fn parse_response(&self, response: Response) -> Result<Self::Output, Error> {
        let rows: Vec<Option<UnversionedRow>> = field(Self::NAME, response.body, "rows")?;
        if rows.len() != self.keys.len() {
            return Err(protocol(
                Self::NAME,
                format!("{} rows returned for {} keys", rows.len(), self.keys.len()),
            ));
        }
        Ok(rows)
    }
}

/// Result of a query: result columns plus rows, either materialised or
/// still streaming.
#[derive(Debug)]
pub struct SelectOutput {
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<UnversionedRow>,
    pub stream: Option<ChunkStream>,
}

/// Runs a query.
#[derive(Debug, Clone)]
pub struct SelectRows {
    pub query: String,
    pub read_from: ReadFrom,
    pub timestamp: Option<u64>,
    /// Most rows the query may read.
    pub input_row_limit: Option<u64>,
    /// Most rows the query may return.
    pub output_row_limit: Option<u64>,
    /// Fail instead of returning a truncated result when a limit is hit.
    pub fail_on_incomplete_result: Option<bool>,
    pub transaction_id: Option<TransactionId>,
}

impl Command for SelectRows {
    type Output = SelectOutput;
    const NAME: &'static str = "select_rows";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<(), Error> {
        if self.query.trim().is_empty() {
            return Err(Error::InvalidArgument("query must not be empty".into()));
        }
        check_timestamp(self.timestamp, self.transaction_id.as_ref())
    }

    fn params(&self) -> Params {
        let mut params = params([
            ("query", self.query.as_str().into()),
            ("read_from", self.read_from.as_str().into()),
        ]);
        let options = [
            ("timestamp", self.timestamp.map(serde_json::Value::from)),
            ("input_row_limit", self.input_row_limit.map(serde_json::Value::from)),
            ("output_row_limit", self.output_row_limit.map(serde_json::Value::from)),
            (
                "fail_on_incomplete_result",
                self.fail_on_incomplete_result.map(serde_json::Value::from),
            ),
        ];
        for (name, value) in options {
            if let Some(value) = value {
                params.insert(name.into(), value);
            }
        }
        params
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    fn wants_stream(&self) -> bool {
        true
    }

    fn parse_response(&self, response: Response) -> Result<SelectOutput, Error> {
        let Response { body, stream, .. } = response;
        let mut body = match body {
            Some(serde_json::Value::Object(map)) => map,
            other => {
                return Err(protocol(
                    Self::NAME,
                    format!("expected an object body, got {:?}", other),
                ))
            }
        };
        let columns = body
            .remove("schema")
            .ok_or_else(|| protocol(Self::NAME, "response lacks \"schema\""))
            .and_then(|v| {
                serde_json::from_value::<Vec<ColumnSchema>>(v)
                    .map_err(|e| protocol(Self::NAME, format!("bad \"schema\": {}", e)))
            })?;
        let rows = match (body.remove("rows"), &stream) {
            (Some(rows), _) => serde_json::from_value(rows)
                .map_err(|e| protocol(Self::NAME, format!("bad \"rows\": {}", e)))?,
            (None, Some(_)) => Vec::new(),
            (None, None) => return Err(protocol(Self::NAME, "response lacks \"rows\"")),
        };
        Ok(SelectOutput {
            columns,
            rows,
            stream,
        })
    }
}

/// Identifier and snapshot timestamp of a new tablet transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StartedTransaction {
    pub transaction_id: TransactionId,
    #[serde(default)]
    pub start_timestamp: u64,
}

/// Starts a tablet transaction.
#[derive(Debug, Clone)]
pub struct StartTransaction {
    pub timeout: Duration,
}

impl Command for StartTransaction {
    type Output = StartedTransaction;
    const NAME: &'static str = "start_transaction";

    fn is_idempotent(&self) -> bool {
        false
    }

    fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidArgument("transaction timeout must be positive".into()));
        }
        Ok(())
    }

    fn params(&self) -> Params {
        params([
            ("type", "tablet".into()),
            (
                "timeout",
                (self.timeout.as_millis().min(u128::from(u64::MAX)) as u64).into(),
            ),
        ])
    }

    fn parse_response(&self, response: Response) -> Result<StartedTransaction, Error> {
        response
            .body
            .ok_or_else(|| protocol(Self::NAME, "empty response"))
            .and_then(|body| {
                serde_json::from_value(body).map_err(|e| protocol(Self::NAME, e))
            })
    }
}

/// Commits a tablet transaction.
#[derive(Debug, Clone)]
pub struct CommitTransaction {
    pub transaction_id: TransactionId,
}

impl Command for CommitTransaction {
    type Output = ();
    const NAME: &'static str = "commit_transaction";

    fn is_idempotent(&self) -> bool {
        false
    }

    fn params(&self) -> Params {
        Params::new()
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        Some(&self.transaction_id)
    }

    fn conflict_codes(&self) -> &'static [ErrorCode] {
        &[
            ErrorCode::TRANSACTION_LOCK_CONFLICT,
            ErrorCode::PREREQUISITE_CHECK_FAILED,
        ]
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Aborts a tablet transaction.
#[derive(Debug, Clone)]
pub struct AbortTransaction {
    pub transaction_id: TransactionId,
}

impl Command for AbortTransaction {
    type Output = ();
    const NAME: &'static str = "abort_transaction";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        Params::new()
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        Some(&self.transaction_id)
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

/// Renews a tablet-transaction lease.
#[derive(Debug, Clone)]
pub struct PingTransaction {
    pub transaction_id: TransactionId,
}

impl Command for PingTransaction {
    type Output = ();
    const NAME: &'static str = "ping_transaction";

    fn is_idempotent(&self) -> bool {
        true
    }

    fn params(&self) -> Params {
        Params::new()
    }

    fn transaction_id(&self) -> Option<&TransactionId> {
        Some(&self.transaction_id)
    }

    fn parse_response(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}
