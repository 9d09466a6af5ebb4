//! Metadata value model
//!
//! Modules report findings as [`MetaValue`], a closed tagged variant that the
//! result serializer can always project to JSON. The single exception is a
//! non-finite float, which JSON cannot carry; the runtime coerces those to
//! their string form when committing module output and raises
//! `METADATA:COERCED:<module>` on the object.

use base64::Engine as _;
use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};
use smol_str::SmolStr;

/// A metadata value emitted by a module
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<MetaValue>),
    Map(IndexMap<SmolStr, MetaValue>),
}

impl MetaValue {
    /// Whether the value can be projected to JSON without loss of meaning
    ///
    /// Only non-finite floats (anywhere in the value) fail this test.
    pub fn is_json_representable(&self) -> bool {
        match self {
            MetaValue::Float(f) => f.is_finite(),
            MetaValue::List(items) => items.iter().all(MetaValue::is_json_representable),
            MetaValue::Map(entries) => entries.values().all(MetaValue::is_json_representable),
            _ => true,
        }
    }

    /// Coerce non-representable leaves to their string form
    pub fn coerced(self) -> MetaValue {
        match self {
            MetaValue::Float(f) if !f.is_finite() => MetaValue::String(f.to_string()),
            MetaValue::List(items) => {
                MetaValue::List(items.into_iter().map(MetaValue::coerced).collect())
            }
            MetaValue::Map(entries) => MetaValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.coerced()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Project the value to JSON
    ///
    /// Total for coerced values. Bytes are emitted as standard base64;
    /// numeric values stay numbers.
    pub fn to_json(&self) -> JsonValue {
        match self {
            MetaValue::Null => JsonValue::Null,
            MetaValue::Bool(b) => json!(b),
            MetaValue::Int(i) => json!(i),
            MetaValue::Float(f) => {
                if f.is_finite() {
                    json!(f)
                } else {
                    json!(f.to_string())
                }
            }
            MetaValue::String(s) => json!(s),
            MetaValue::Bytes(b) => {
                json!(base64::engine::general_purpose::STANDARD.encode(b))
            }
            MetaValue::List(items) => {
                JsonValue::Array(items.iter().map(MetaValue::to_json).collect())
            }
            MetaValue::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::String(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<u64> for MetaValue {
    fn from(value: u64) -> Self {
        MetaValue::Int(value as i64)
    }
}

impl From<usize> for MetaValue {
    fn from(value: usize) -> Self {
        MetaValue::Int(value as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<ferroscan_rules::MetaValue> for MetaValue {
    fn from(value: ferroscan_rules::MetaValue) -> Self {
        match value {
            ferroscan_rules::MetaValue::String(s) => MetaValue::String(s.to_string()),
            ferroscan_rules::MetaValue::Integer(i) => MetaValue::Int(i),
            ferroscan_rules::MetaValue::Boolean(b) => MetaValue::Bool(b),
        }
    }
}
