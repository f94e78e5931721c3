//! Row sets carried in attachments
//!
//! Rows travel next to the structured message as raw attachments. Each attachment holds a
//! sequence of rows, every row being a length-prefixed JSON object:
//!
//! ```text
//! [4-byte length as u32 big-endian] [JSON object] [4-byte length] [JSON object] ...
//! ```
//!
//! The structured part of a response describes the columns of the row set
//! ([`RowsetDescriptor`]). [`RowReader`] only ever exposes rows that were fully decoded and
//! validated against that descriptor.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::error::{Result, RpcError};

/// One row: column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Maximum size of a single encoded row (16 MB).
pub const MAX_ROW_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Rows lacking a required column are rejected.
    #[serde(default)]
    pub required: bool,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }

    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }
}

/// Column layout of a row set, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsetDescriptor {
    pub columns: Vec<Column>,
}

impl RowsetDescriptor {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Builds a descriptor of optional columns.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: names.into_iter().map(Column::new).collect(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Checks a single row against the column layout.
    ///
    /// An empty descriptor accepts any row.
    pub fn validate(&self, index: usize, row: &Row) -> Result<()> {
        if self.columns.is_empty() {
            return Ok(());
        }

        for key in row.keys() {
            if self.column(key).is_none() {
                return Err(RpcError::Protocol(format!(
                    "row {} has unknown column '{}'",
                    index, key
                )));
            }
        }

        for column in self.columns.iter().filter(|c| c.required) {
            match row.get(&column.name) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(RpcError::Protocol(format!(
                        "row {} is missing required column '{}'",
                        index, column.name
                    )))
                }
            }
        }

        Ok(())
    }
}

/// Encodes rows into a single attachment.
///
/// # Arguments
///
/// * `rows` - The rows to encode
///
/// # Returns
///
/// The attachments to send next to the request (empty when there are no rows)
pub fn encode_to_wire(rows: &[Row]) -> Result<Vec<Bytes>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut buf = BytesMut::new();
    for row in rows {
        let data = serde_json::to_vec(row)?;
        if data.len() > MAX_ROW_SIZE {
            return Err(RpcError::InvalidRequest(format!(
                "row too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_ROW_SIZE
            )));
        }
        buf.put_u32(data.len() as u32);
        buf.put_slice(&data);
    }

    Ok(vec![buf.freeze()])
}

/// Decodes every row carried in `attachments`.
///
/// Fails as a whole on the first truncated or malformed row.
pub fn decode_from_wire(attachments: &[Bytes]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();

    for (n, attachment) in attachments.iter().enumerate() {
        let mut buf = attachment.clone();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(RpcError::Protocol(format!(
                    "attachment {} truncated in row length prefix",
                    n
                )));
            }
            let len = buf.get_u32() as usize;
            if len > MAX_ROW_SIZE {
                return Err(RpcError::Protocol(format!(
                    "row too large: {} bytes (max {} bytes)",
                    len, MAX_ROW_SIZE
                )));
            }
            if buf.remaining() < len {
                return Err(RpcError::Protocol(format!(
                    "attachment {} truncated: row needs {} bytes, {} left",
                    n,
                    len,
                    buf.remaining()
                )));
            }
            let data = buf.split_to(len);
            let row: Row = serde_json::from_slice(&data)
                .map_err(|e| RpcError::Protocol(format!("malformed row in attachment {}: {}", n, e)))?;
            rows.push(row);
        }
    }

    Ok(rows)
}

/// Sequential reader over a decoded and validated row set.
#[derive(Debug, Clone)]
pub struct RowReader {
    descriptor: RowsetDescriptor,
    rows: VecDeque<Row>,
}

impl RowReader {
    /// Validates every row against `descriptor`; a single bad row rejects the whole set.
    pub fn new(descriptor: RowsetDescriptor, rows: Vec<Row>) -> Result<Self> {
        for (index, row) in rows.iter().enumerate() {
            descriptor.validate(index, row)?;
        }

        Ok(Self {
            descriptor,
            rows: rows.into(),
        })
    }

    /// Decodes attachments and validates the result in one step.
    pub fn from_wire(descriptor: RowsetDescriptor, attachments: &[Bytes]) -> Result<Self> {
        let rows = decode_from_wire(attachments)?;
        Self::new(descriptor, rows)
    }

    pub fn descriptor(&self) -> &RowsetDescriptor {
        &self.descriptor
    }

    /// Number of rows not yet read.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Reads the next row into a typed value.
    pub fn scan<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        self.next_row().map(|row| {
            serde_json::from_value(serde_json::Value::Object(row))
                .map_err(|e| RpcError::Protocol(format!("failed to scan row: {}", e)))
        })
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.into()
    }
}

impl Iterator for RowReader {
    type Item = Row;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row()
    }
}
