//! Value types for replmon-pool
//!
//! A small dynamic value model covering what the monitoring catalog views
//! return: integers, floats, text, booleans, timestamps, JSON and bytea.
//! Rows keep column names so mappers can tolerate version-gated columns that
//! are missing on older servers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SQL value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER, OID)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION, NUMERIC)
    Float64(f64),
    /// Text string (TEXT, VARCHAR, NAME, pg_lsn, interval, inet rendered as text)
    String(String),
    /// Binary data (BYTEA)
    Bytes(Vec<u8>),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "on" | "yes" | "1" => Some(true),
                "false" | "f" | "off" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to borrow as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to convert to a UTC timestamp
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTimeTz(dt) => Some(*dt),
            Self::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Try to borrow as JSON
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(j) => Some(j),
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
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A database row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (columns, values) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Whether the column is present at all (distinct from present-but-NULL)
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Text column; `None` when missing or NULL
    pub fn opt_str(&self, name: &str) -> Option<String> {
        self.get_by_name(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Integer column; `None` when missing, NULL or not numeric
    pub fn opt_i64(&self, name: &str) -> Option<i64> {
        self.get_by_name(name).and_then(Value::as_i64)
    }

    /// Float column; `None` when missing, NULL or not numeric
    pub fn opt_f64(&self, name: &str) -> Option<f64> {
        self.get_by_name(name).and_then(Value::as_f64)
    }

    /// Boolean column; `None` when missing or NULL
    pub fn opt_bool(&self, name: &str) -> Option<bool> {
        self.get_by_name(name).and_then(Value::as_bool)
    }

    /// Timestamp column; `None` when missing or NULL
    pub fn opt_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get_by_name(name).and_then(Value::as_timestamp)
    }

    /// JSON column; `None` when missing or NULL
    pub fn opt_json(&self, name: &str) -> Option<serde_json::Value> {
        self.get_by_name(name).and_then(Value::as_json).cloned()
    }

    /// Required text column
    pub fn try_str(&self, name: &str) -> Result<String> {
        self.opt_str(name).ok_or_else(|| {
            Error::type_conversion(format!("column '{name}' is missing or not text"))
        })
    }

    /// Required integer column
    pub fn try_i64(&self, name: &str) -> Result<i64> {
        self.opt_i64(name).ok_or_else(|| {
            Error::type_conversion(format!("column '{name}' is missing or not an integer"))
        })
    }

    /// Required boolean column
    pub fn try_bool(&self, name: &str) -> Result<bool> {
        self.opt_bool(name).ok_or_else(|| {
            Error::type_conversion(format!("column '{name}' is missing or not a boolean"))
        })
    }
}
