//! Storage value model and the per-session change tracker
//!
//! Storage values are the engine's only persistent data shape; they are
//! opaque to the host beyond this encoding. The canonical JSON projection
//! distinguishes array-form tables (dense 1..=N integer keys, N >= 1) from
//! map-form tables; the empty table projects to the map form `{}`.

pub mod changes;
pub mod errors;

pub use changes::{ChangeSet, StorageChangeRecord};
pub use errors::{StorageError, StorageResult};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A persistable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StorageValue {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    String(String),
    /// Map-form table; nested values are depth-bounded at write time
    Table(BTreeMap<String, StorageValue>),
    /// Array-form table
    Array(Vec<StorageValue>),
    /// Opaque byte stream
    Stream(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Preserved but uninterpretable content
    Unsupported,
}

/// Maximum nesting depth accepted when persisting tables
pub const MAX_STORAGE_DEPTH: usize = 16;

impl StorageValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StorageValue::Null => "null",
            StorageValue::Bool(_) => "bool",
            StorageValue::Int(_) => "int",
            StorageValue::Number(_) => "number",
            StorageValue::String(_) => "string",
            StorageValue::Table(_) => "table",
            StorageValue::Array(_) => "array",
            StorageValue::Stream(_) => "stream",
            StorageValue::Unsupported => "unsupported",
        }
    }

    /// Canonical JSON projection
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StorageValue::Null => serde_json::Value::Null,
            StorageValue::Bool(b) => serde_json::Value::Bool(*b),
            StorageValue::Int(i) => serde_json::Value::from(*i),
            StorageValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            StorageValue::String(s) => serde_json::Value::String(s.clone()),
            StorageValue::Table(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            StorageValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            StorageValue::Stream(bytes) => serde_json::Value::String(hex::encode(bytes)),
            StorageValue::Unsupported => serde_json::Value::Null,
        }
    }

    /// Build from a JSON value (inverse of the canonical projection)
    pub fn from_json(value: &serde_json::Value) -> StorageValue {
        match value {
            serde_json::Value::Null => StorageValue::Null,
            serde_json::Value::Bool(b) => StorageValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    StorageValue::Int(i)
                } else {
                    StorageValue::Number(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => StorageValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                StorageValue::Array(items.iter().map(StorageValue::from_json).collect())
            }
            serde_json::Value::Object(map) => StorageValue::Table(
                map.iter()
                    .map(|(k, v)| (k.clone(), StorageValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let mut inner = BTreeMap::new();
        inner.insert("name".to_string(), StorageValue::String("ada".into()));
        inner.insert("age".to_string(), StorageValue::Int(36));
        let value = StorageValue::Table(inner);
        let json = value.to_json();
        assert_eq!(StorageValue::from_json(&json), value);
    }

    #[test]
    fn test_array_form_projection() {
        let value = StorageValue::Array(vec![
            StorageValue::Int(1),
            StorageValue::Int(2),
            StorageValue::Int(3),
        ]);
        assert_eq!(value.to_json().to_string(), "[1,2,3]");
    }

    #[test]
    fn test_serde_encoding_stable() {
        let value = StorageValue::Int(42);
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: StorageValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }
}
