// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Column descriptors and table schemas.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::Value;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Uint64,
    Double,
    Boolean,
    String,
    Any,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Int64 => "int64",
            ColumnType::Uint64 => "uint64",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
            ColumnType::Any => "any",
        }
    }

    /// Returns true if a non-null `value` may be stored in a column of this type.
    ///
    /// Assignment is exact: no numeric widening is performed, so decoding an
    /// encoded row always reproduces the original value.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (ColumnType::Any, _) => true,
            (_, Value::Null) => true,
            (ty, value) => value.column_type() == Some(ty),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort order of a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
}

/// Function that merges an aggregate column's stored value with a written one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// Descriptor of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateFunction>,
}

impl ColumnSchema {
    /// Creates a non-key column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            sort_order: None,
            aggregate: None,
        }
    }

    /// Creates an ascending key column.
    pub fn key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            sort_order: Some(SortOrder::Ascending),
            aggregate: None,
        }
    }

    /// Makes the column an aggregate column.
    pub fn with_aggregate(mut self, function: AggregateFunction) -> Self {
        self.aggregate = Some(function);
        self
    }

    /// Returns true for key columns.
    #[inline]
    pub fn is_key(&self) -> bool {
        self.sort_order.is_some()
    }
}

/// Ordered column set of a table.
///
/// Invariants: column names are unique and every key column precedes every
/// non-key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Validates and builds a schema.
    pub fn new(columns: Vec<ColumnSchema>) -> Result<Self, Error> {
        if columns.is_empty() {
            return Err(Error::InvalidArgument("schema must have at least one column".into()));
        }

        let mut seen = HashSet::with_capacity(columns.len());
        let mut in_value_columns = false;
        for column in &columns {
            if column.name.is_empty() {
                return Err(Error::InvalidArgument("column name must not be empty".into()));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate column {:?} in schema",
                    column.name
                )));
            }
            if let Some(function) = column.aggregate {
                let numeric = matches!(
                    column.column_type,
                    ColumnType::Int64 | ColumnType::Uint64 | ColumnType::Double
                );
                if column.is_key() || !numeric {
                    return Err(Error::InvalidArgument(format!(
                        "column {:?} cannot aggregate with {}: only numeric non-key columns can",
                        column.name,
                        function.as_str()
                    )));
                }
            }
            if column.is_key() {
                if in_value_columns {
                    return Err(Error::InvalidArgument(format!(
                        "key column {:?} follows a non-key column",
                        column.name
                    )));
                }
            } else {
                in_value_columns = true;
            }
        }

        Ok(Self { columns })
    }

    /// Returns all columns in order.
    #[inline]
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Returns the key columns (a prefix of `columns()`).
    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.key_column_count()]
    }

    /// Returns the number of key columns.
    pub fn key_column_count(&self) -> usize {
        self.columns.iter().take_while(|c| c.is_key()).count()
    }

    /// Returns true if the table has at least one key column.
    pub fn is_sorted(&self) -> bool {
        self.key_column_count() > 0
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the position of a column by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns a schema restricted to the named columns, in the given order.
    ///
    /// Projections are used to decode lookup results; they are not subject to
    /// the key-prefix invariant.
    pub fn project(&self, names: &[String]) -> Result<Vec<ColumnSchema>, Error> {
        names
            .iter()
            .map(|name| {
                self.column(name).cloned().ok_or_else(|| {
                    Error::InvalidArgument(format!("no such column {:?} in schema", name))
                })
            })
            .collect()
    }
}

impl<'de> Deserialize<'de> for TableSchema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let columns = Vec::<ColumnSchema>::deserialize(deserializer)?;
        TableSchema::new(columns).map_err(serde::de::Error::custom)
    }
}
