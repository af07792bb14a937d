//! Layer merging for session configuration
//!
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins), so `scratch.ram_dirs` from a file
//!   replaces the built-in list instead of extending it
//! - Scalars: override (last wins)

use serde_json::{Map, Value};

/// Deep merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in order; the last layer has the highest precedence.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Set `value` at a dot-separated `path`, creating intermediate objects.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    match path.split_once('.') {
        Some((head, rest)) => {
            let child = as_object(target)
                .entry(head.to_string())
                .or_insert(Value::Null);
            set_path(child, rest, value);
        }
        None => {
            as_object(target).insert(path.to_string(), value);
        }
    }
}

/// View `value` as an object, replacing any non-object with `{}`.
fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}
