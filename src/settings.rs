//! Settings merge — combines host defaults with user overrides.
//!
//! Settings trees are opaque to the bridge: unknown keys pass through
//! verbatim and no server-specific option semantics are interpreted. The
//! merged result goes into the initialize payload unmodified.

use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Deep-merge `overrides` into `defaults`.
///
/// Objects merge recursively with sibling keys preserved; scalar and array
/// override leaves replace the corresponding default. An array↔object
/// mismatch is a [`BridgeError::ConfigMergeConflict`] carrying the dotted
/// key path. Merging is idempotent: re-applying `overrides` to the result
/// changes nothing.
pub fn merge(defaults: &Value, overrides: &Value) -> Result<Value> {
    merge_at("", defaults, overrides)
}

fn merge_at(path: &str, defaults: &Value, overrides: &Value) -> Result<Value> {
    match (defaults, overrides) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, over_value) in over {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                let next = match base.get(key) {
                    Some(base_value) => merge_at(&child_path, base_value, over_value)?,
                    None => over_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Ok(Value::Object(merged))
        }
        (Value::Object(_), Value::Array(_)) | (Value::Array(_), Value::Object(_)) => {
            Err(BridgeError::ConfigMergeConflict {
                path: path.to_string(),
                default_kind: kind(defaults),
                override_kind: kind(overrides),
            })
        }
        // Leaf override wins: scalars and arrays replace in place.
        (_, over) => Ok(over.clone()),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
