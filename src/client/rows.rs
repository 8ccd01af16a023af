// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use futures_util::stream::{self, Stream};

use crate::codec::{decode_row, UnversionedRow};
use crate::error::{Error, TransportError};
use crate::schema::{ColumnSchema, Row};
use crate::transport::ChunkStream;

/// Rows of a query, consumed once.
///
/// Rows buffered from the first reply are yielded before any further chunk
/// is awaited. Each chunk wait is bounded by the client's request timeout.
/// Dropping the stream before its end cancels the query on the server.
#[derive(Debug)]
pub struct RowStream {
    columns: Vec<ColumnSchema>,
    buffered: VecDeque<UnversionedRow>,
    chunks: Option<ChunkStream>,
}

impl RowStream {
    pub(crate) fn new(
        columns: Vec<ColumnSchema>,
        buffered: VecDeque<UnversionedRow>,
        chunks: Option<ChunkStream>,
    ) -> Self {
        Self {
            columns,
            buffered,
            chunks,
        }
    }

    /// Result columns, in row order.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return decode_row(row, &self.columns).map(Some);
            }
            let Some(chunks) = self.chunks.as_mut() else {
                return Ok(None);
            };
            match chunks.next_chunk().await {
                Ok(Some(chunk)) => {
                    for value in chunk {
                        let row = serde_json::from_value::<UnversionedRow>(value).map_err(|e| {
                            TransportError::protocol(format!("bad streamed row: {}", e))
                        })?;
                        self.buffered.push_back(row);
                    }
                }
                Ok(None) => {
                    self.chunks = None;
                    return Ok(None);
                }
                Err(err) => {
                    self.chunks = None;
                    return Err(err);
                }
            }
        }
    }

    /// Drains the stream into a vector.
    pub async fn try_collect(mut self) -> Result<Vec<Row>, Error> {
        let mut rows = Vec::with_capacity(self.buffered.len());
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Stops reading and cancels the rest of the query.
    pub fn close(mut self) {
        if let Some(mut chunks) = self.chunks.take() {
            chunks.cancel();
        }
    }

    /// Adapts the stream to [`futures_util::Stream`]. The stream ends after
    /// the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Row, Error>> {
        stream::unfold(Some(self), |state| async move {
            let mut rows = state?;
            match rows.next_row().await {
                Ok(Some(row)) => Some((Ok(row), Some(rows))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
