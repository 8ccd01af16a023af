// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Row codec: name-keyed rows to positional rows and back.
//!
//! Encoding validates a row against the schema before anything is sent:
//! unknown columns, type mismatches, non-finite doubles and missing key
//! columns are rejected with [`Error::SchemaViolation`]. Missing non-key
//! columns encode as null.
//!
//! Decoding is the inverse and yields every column of the result schema,
//! nulls included. Since [`Row`] equality does not distinguish an absent
//! column from a null one, `decode(encode(r, s), s) == r` holds for every row
//! `r` that conforms to `s`, including rows that omit non-key columns.
//!
//! Partial rows for update writes keep only the columns they name; see
//! [`encode_partial_row`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, TransportError};
use crate::schema::{ColumnSchema, Row, TableSchema, Value};

/// A row in schema column order, as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnversionedRow(pub Vec<Value>);

impl UnversionedRow {
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What part of the schema a row must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Full rows for inserts: keys required, missing values become null.
    Write,
    /// Key-only rows for lookups and deletes: exactly the key columns.
    Key,
}

/// Checks every column the row names against `schema`.
fn check_columns(row: &Row, schema: &TableSchema, key_only: bool) -> Result<(), Error> {
    let key_count = schema.key_column_count();

    for (name, value) in row.iter() {
        let Some(position) = schema.position(name) else {
            return Err(Error::SchemaViolation(format!("unknown column {:?}", name)));
        };
        let column = &schema.columns()[position];
        if key_only && position >= key_count {
            return Err(Error::SchemaViolation(format!(
                "column {:?} is not a key column",
                name
            )));
        }
        if !column.column_type.accepts(value) {
            return Err(Error::SchemaViolation(format!(
                "column {:?} has type {} but got {} value {}",
                name,
                column.column_type,
                value.type_name(),
                value
            )));
        }
        // JSON has no representation for NaN or infinities.
        if matches!(value, Value::Double(v) if !v.is_finite()) {
            return Err(Error::SchemaViolation(format!(
                "column {:?} holds non-finite double {}",
                name, value
            )));
        }
    }
    Ok(())
}

fn check_keys(row: &Row, schema: &TableSchema) -> Result<(), Error> {
    match schema
        .key_columns()
        .iter()
        .find(|column| row.get(&column.name).map_or(true, Value::is_null))
    {
        Some(column) => Err(Error::SchemaViolation(format!(
            "key column {:?} is missing",
            column.name
        ))),
        None => Ok(()),
    }
}

/// Encodes one row against `schema`.
pub fn encode_row(row: &Row, schema: &TableSchema, mode: EncodeMode) -> Result<UnversionedRow, Error> {
    check_columns(row, schema, mode == EncodeMode::Key)?;
    check_keys(row, schema)?;

    let width = match mode {
        EncodeMode::Write => schema.columns().len(),
        EncodeMode::Key => schema.key_column_count(),
    };
    let values = schema.columns()[..width]
        .iter()
        .map(|column| row.get(&column.name).cloned().unwrap_or(Value::Null))
        .collect();
    Ok(UnversionedRow(values))
}

/// Validates a row for an update write.
///
/// Key columns are required. Only the columns the row names are kept, so
/// the service leaves every other stored column as it is; an explicit null
/// still overwrites.
pub fn encode_partial_row(row: &Row, schema: &TableSchema) -> Result<Row, Error> {
    check_columns(row, schema, false)?;
    check_keys(row, schema)?;
    Ok(row.clone())
}

/// Encodes a batch; fails on the first invalid row.
pub fn encode_rows(
    rows: &[Row],
    schema: &TableSchema,
    mode: EncodeMode,
) -> Result<Vec<UnversionedRow>, Error> {
    rows.iter()
        .map(|row| encode_row(row, schema, mode))
        .collect()
}

/// Encodes a batch of partial rows; fails on the first invalid row.
pub fn encode_partial_rows(rows: &[Row], schema: &TableSchema) -> Result<Vec<Row>, Error> {
    rows.iter().map(|row| encode_partial_row(row, schema)).collect()
}

/// Decodes a positional row using the result columns.
///
/// A row that does not match its columns is a protocol violation by the
/// service, not a caller error.
pub fn decode_row(row: UnversionedRow, columns: &[ColumnSchema]) -> Result<Row, Error> {
    if row.len() != columns.len() {
        return Err(TransportError::protocol(format!(
            "row has {} values but result schema has {} columns",
            row.len(),
            columns.len()
        ))
        .into());
    }

    let mut decoded = Row::new();
    for (value, column) in row.0.into_iter().zip(columns) {
        if !column.column_type.accepts(&value) {
            return Err(TransportError::protocol(format!(
                "column {:?} of type {} holds {} value",
                column.name,
                column.column_type,
                value.type_name()
            ))
            .into());
        }
        decoded.insert(column.name.clone(), value);
    }
    Ok(decoded)
}

/// Decodes a batch of positional rows.
pub fn decode_rows(rows: Vec<UnversionedRow>, columns: &[ColumnSchema]) -> Result<Vec<Row>, Error> {
    rows.into_iter().map(|row| decode_row(row, columns)).collect()
}

/// Returns a hashable identity for an encoded key, used to deduplicate keys.
pub(crate) fn key_identity(key: &UnversionedRow) -> String {
    // Tagged JSON is injective over values, which is all identity needs.
    serde_json::to_string(key).unwrap_or_default()
}
