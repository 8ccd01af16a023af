// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Table schemas, typed values and rows.
//!
//! A schema is an ordered list of typed columns whose key columns
//! (`sort_order = ascending`) form a prefix. Rows at the API surface are
//! name-keyed maps; the [`codec`](crate::codec) module turns them into
//! positional rows that follow the schema order.
//!
//! # Example
//!
//! ```
//! use ytclient::schema::{ColumnSchema, ColumnType, Row, TableSchema};
//!
//! let schema = TableSchema::new(vec![
//!     ColumnSchema::key("x", ColumnType::Int64),
//!     ColumnSchema::new("y", ColumnType::Int64),
//! ])
//! .unwrap();
//! assert_eq!(schema.key_column_count(), 1);
//!
//! let row = Row::new().with("x", 0).with("y", 99);
//! assert_eq!(row.len(), 2);
//! ```

mod row;
mod table_schema;
mod value;

pub use row::Row;
pub use table_schema::{AggregateFunction, ColumnSchema, ColumnType, SortOrder, TableSchema};
pub use value::Value;
