//! Sanitize binding values to prevent prototype pollution in scripts.
//!
//! Removes dangerous keys like `__proto__`, `constructor`, and `prototype`
//! and cuts off nesting beyond a fixed depth. Never fails, so binding
//! construction stays infallible.

use crate::binding::BindingName;
use serde_json::{Map, Value};

/// Maximum recursion depth for nested objects/arrays
const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Sanitize the value bound under `name`, logging anything removed.
pub fn sanitize_binding(name: BindingName, value: Value) -> Value {
    let mut removed = Vec::new();
    let sanitized = sanitize_recursive(value, 0, &mut removed);
    if !removed.is_empty() {
        tracing::warn!(
            "Removed unsafe entries from '{}' binding: {}",
            name.as_str(),
            removed.join(", ")
        );
    }
    sanitized
}

fn sanitize_recursive(value: Value, depth: usize, removed: &mut Vec<String>) -> Value {
    if depth > MAX_DEPTH {
        removed.push(format!("<nesting beyond {} levels>", MAX_DEPTH));
        return Value::Null;
    }

    match value {
        Value::Object(map) => {
            let mut sanitized = Map::new();
            for (key, val) in map {
                if DANGEROUS_KEYS.contains(&key.as_str()) {
                    removed.push(key);
                    continue;
                }
                sanitized.insert(key, sanitize_recursive(val, depth + 1, removed));
            }
            Value::Object(sanitized)
        }
        Value::Array(arr) => Value::Array(
            arr.into_iter()
                .map(|v| sanitize_recursive(v, depth + 1, removed))
                .collect(),
        ),
        // Primitives are safe
        other => other,
    }
}
