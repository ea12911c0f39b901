//! Canonical JSON: compact output with object keys sorted at every depth.
//!
//! This is the equality oracle for snapshots and mirror payloads. It does not
//! depend on `serde_json`'s map ordering, which changes when any crate in the
//! build enables `preserve_order`.

use crate::error::StateError;
use serde::Serialize;
use serde_json::Value;

/// Serialize any value to canonical JSON.
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, StateError> {
    let value = serde_json::to_value(value).map_err(StateError::serialization)?;
    Ok(canonical_value(&value))
}

/// Render an already-decoded JSON value canonically.
pub fn canonical_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(item) = map.get(*key) {
                    write_canonical(item, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a plain &str cannot fail.
    match serde_json::to_string(s) {
        Ok(encoded) => out.push_str(&encoded),
        Err(_) => out.push_str("\"\""),
    }
}
