//! Field types, cell values and the columnar batch file format.
//!
//! Every stream carries an ordered list of `(name, FieldType)` pairs; rows
//! are `Vec<Value>` positionally matching that list. Batch files are stored
//! column-major with the schema in the header so a drained batch can be
//! inserted without consulting the registry.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Semantic column types shared by streams and replicated tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Str,
    Float,
    Int,
    UInt,
    Bool,
    /// Millisecond UTC timestamp.
    DateTime,
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    /// Millisecond UTC timestamp.
    DateTime(i64),
}

pub type Row = Vec<Value>;

impl Value {
    /// Compare two values of the same variant. Cursor columns always yield
    /// the same variant across cycles, so mixed variants return `None` and
    /// the caller treats that as a refused comparison.
    pub fn cmp_same(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::UInt(a), Value::UInt(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::DateTime(ms) => write!(f, "{}", format_datetime_ms(*ms)),
        }
    }
}

/// Format a millisecond timestamp as `YYYY-MM-DD HH:MM:SS.mmm` (UTC).
pub fn format_datetime_ms(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{}", ms),
    }
}

/// Parse datetime strings as emitted by analytical stores.
///
/// Accepts `YYYY-MM-DD HH:MM:SS[.fff]` and bare `YYYY-MM-DD` (midnight).
pub fn parse_datetime_str(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    None
}

/// On-disk batch file: schema-tagged, column-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub stream: String,
    pub seq: u64,
    /// Millisecond UTC creation timestamp.
    pub created_at: i64,
    pub columns: Vec<String>,
    pub types: Vec<FieldType>,
    /// One vector per column, all the same length.
    pub data: Vec<Vec<Value>>,
}

impl BatchFile {
    pub fn from_rows(
        stream: &str,
        seq: u64,
        created_at: i64,
        columns: Vec<String>,
        types: Vec<FieldType>,
        rows: Vec<Row>,
    ) -> Self {
        let mut data: Vec<Vec<Value>> = columns.iter().map(|_| Vec::with_capacity(rows.len())).collect();
        for row in rows {
            for (i, value) in row.into_iter().enumerate() {
                data[i].push(value);
            }
        }
        Self {
            stream: stream.to_string(),
            seq,
            created_at,
            columns,
            types,
            data,
        }
    }

    pub fn row_count(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Transpose back to row-major for target inserts.
    pub fn rows(&self) -> Vec<Row> {
        let n = self.row_count();
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            rows.push(self.data.iter().map(|col| col[i].clone()).collect());
        }
        rows
    }
}
