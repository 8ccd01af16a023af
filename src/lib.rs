// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! ytclient: client-side access to YT dynamic tables
//!
//! This crate lets an application create, mount and remove sorted dynamic
//! tables, read and write rows, run queries, and group row operations into
//! tablet transactions, over either the HTTP proxy API or the native
//! multiplexed RPC channel.
//!
//! ```no_run
//! use ytclient::{Client, ClientConfig, ColumnSchema, ColumnType, CreateOptions, Row, TableSchema, YPath};
//!
//! # async fn example() -> Result<(), ytclient::Error> {
//! let client = Client::new(ClientConfig::new("localhost:8000"))?;
//! let path = YPath::new("//tmp/t")?;
//! let schema = TableSchema::new(vec![
//!     ColumnSchema::key("x", ColumnType::Int64),
//!     ColumnSchema::new("y", ColumnType::Int64),
//! ])?;
//! client.create_table(&path, schema, CreateOptions::default().with_force(true)).await?;
//! client.mount_table(&path, true).await?;
//! client.insert_rows(&path, vec![Row::new().with("x", 0).with("y", 99)]).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod path;
pub mod schema;
pub mod transport;
pub mod txn;

pub use client::{
    Backend, Client, ClientConfig, CreateOptions, InsertOptions, LookupOptions, ReadFrom,
    RetryPolicy, RowStream, SelectOptions, TableHandle,
};
pub use codec::{EncodeMode, UnversionedRow};
pub use dispatcher::commands::MountState;
pub use error::{Error, ErrorCode, ServiceError, TransportError, TransportErrorKind};
pub use path::YPath;
pub use schema::{AggregateFunction, ColumnSchema, ColumnType, Row, SortOrder, TableSchema, Value};
pub use txn::{PendingWrite, Transaction, TransactionId, TxnState, WriteKind};
