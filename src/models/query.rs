//! Statement-related data models.
//!
//! This module defines the typed values exchanged with the resource: bind
//! parameters, row cells, column metadata and statement classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of rows retrieved per fetch call.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Maximum allowed rows per fetch call.
pub const MAX_BUFFER_SIZE: usize = 10_000;

/// A typed value, used both for positional bind parameters and for row cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Text value
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One result row: cells aligned to the statement's column metadata.
pub type Row = Vec<Value>;

/// A row keyed by column label, or an input record for list inserts.
pub type Record = BTreeMap<String, Value>;

/// Column metadata, resolved once per statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_name: String,
    /// Declared precision; 0 when the resource does not report one.
    pub precision: u32,
    /// Declared scale; 0 when the resource does not report one.
    pub scale: u32,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            precision: 0,
            scale: 0,
        }
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }
}

/// Statement classification, derived from the command shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// Produces a cursor over result rows.
    Query,
    /// Produces an update count.
    Update,
}

/// Statement lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Open,
    Streaming,
    Closed,
}

/// Options for streaming a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Rows retrieved per fetch call. Default: 100, max: 10000
    pub buffer_size: usize,
}

impl StreamOptions {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            // Clamp to [1, MAX_BUFFER_SIZE]; a zero-sized fetch could never make progress
            buffer_size: buffer_size.clamp(1, MAX_BUFFER_SIZE),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Pair a row with its column labels.
pub fn to_record(columns: &[ColumnMetadata], row: Row) -> Record {
    columns
        .iter()
        .map(|c| c.name.clone())
        .zip(row)
        .collect()
}
