//! Row payload types for the transaction core
//!
//! The core treats row contents as opaque: the SQL layer evaluates
//! expressions, the storage layer serializes. `Value` is the payload
//! currency between them.
//!
//! Note the distinction the MVCC layer depends on: `Value::Null` is a
//! *stored* SQL null, while "no visible version" (sightless) is modelled
//! as `Option<Value>::None` at the cell and never as a `Value`.

use serde::{Deserialize, Serialize};

/// Unified row payload value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// Integer value
    Integer(i64),

    /// Floating point value
    Float(f64),

    /// Boolean value
    Bool(bool),

    /// Text string
    Text(String),

    /// Raw bytes (serialized row body from the SQL layer)
    Bytes(Vec<u8>),

    /// Stored SQL null
    Null,
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

/// A row is a list of values (positional, schema held by the SQL layer)
pub type Row = Vec<Value>;

/// Transaction identifier (doubles as the snapshot marker for RR reads)
pub type TransactionId = u64;

/// Commit timestamp, drawn from the same monotone counter as transaction ids
pub type Timestamp = u64;

/// Stable identity of a versioned cell, unique across all maps
pub type CellId = u64;
