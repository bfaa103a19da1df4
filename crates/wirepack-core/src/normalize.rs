//! Canonical Message Bytes
//!
//! A message enters the pipeline as arbitrary JSON and leaves the normalizer
//! as *canonical bytes*: compact UTF-8 JSON with keys sorted lexicographically
//! at every nesting level and all volatile keys removed. Determinism is what
//! makes small per-topic dictionaries effective; two messages that differ only
//! in key order or whitespace must produce identical bytes.
//!
//! `serde_json`'s map type keeps keys ordered, so building a scrubbed `Value`
//! and serializing it compactly yields the canonical form directly.
//!
//! Volatile keys (per-topic configurable, e.g. trace identifiers injected by
//! load balancers) are stripped wherever they appear, including inside nested
//! objects and arrays of objects.

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{Error, Result};

/// Serialize a message to canonical bytes, dropping volatile keys.
///
/// The input must be a JSON object; anything else is rejected with
/// [`Error::BadMessage`]. The output is stable under a parse/serialize
/// round-trip and independent of the input's key order.
pub fn normalize(msg: &Value, volatile: &HashSet<String>) -> Result<Vec<u8>> {
    if !msg.is_object() {
        return Err(Error::BadMessage(format!(
            "message must be a JSON object, got {}",
            json_type_name(msg)
        )));
    }
    let scrubbed = scrub(msg, volatile);
    serde_json::to_vec(&scrubbed).map_err(|e| Error::BadMessage(e.to_string()))
}

/// Rebuild a value without volatile keys, at every nesting level.
fn scrub(value: &Value, volatile: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !volatile.contains(key.as_str()))
                .map(|(key, val)| (key.clone(), scrub(val, volatile)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| scrub(v, volatile)).collect()),
        other => other.clone(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
