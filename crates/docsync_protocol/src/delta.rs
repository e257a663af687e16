//! JSON delta codec.
//!
//! A delta describes how to turn a base body into a target body:
//!
//! - For two objects, the delta is an object holding only changed keys.
//!   `[]` removes the key, `[v]` sets it to `v`, and a nested object is a
//!   delta applied to an object-valued property.
//! - Anything else is replaced wholesale, encoded as `[v]`.
//!
//! Wrapping replacement values in a one-element array keeps them
//! distinguishable from nested deltas.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// Computes the delta that turns `base` into `target`.
pub fn create_delta(base: &Value, target: &Value) -> Value {
    match (base, target) {
        (Value::Object(base), Value::Object(target)) => Value::Object(object_delta(base, target)),
        _ => Value::Array(vec![target.clone()]),
    }
}

/// Reconstructs the target body from `base` and a delta produced by
/// [`create_delta`].
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidDelta`] if the delta is malformed or does
/// not fit the base (for example removing a key the base lacks).
pub fn apply_delta(base: &Value, delta: &Value) -> ProtocolResult<Value> {
    match delta {
        Value::Array(items) if items.len() == 1 => Ok(items[0].clone()),
        Value::Object(changes) => match base {
            Value::Object(base) => Ok(Value::Object(apply_object(base.clone(), changes)?)),
            _ => Err(ProtocolError::invalid_delta("object delta on non-object base")),
        },
        _ => Err(ProtocolError::invalid_delta("delta must be an object or [value]")),
    }
}

fn object_delta(base: &Map<String, Value>, target: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();

    for (key, new_value) in target {
        match (base.get(key), new_value) {
            (Some(old_value), _) if old_value == new_value => {}
            (Some(Value::Object(old)), Value::Object(new)) => {
                delta.insert(key.clone(), Value::Object(object_delta(old, new)));
            }
            _ => {
                delta.insert(key.clone(), Value::Array(vec![new_value.clone()]));
            }
        }
    }

    for key in base.keys() {
        if !target.contains_key(key) {
            delta.insert(key.clone(), Value::Array(Vec::new()));
        }
    }

    delta
}

fn apply_object(
    mut base: Map<String, Value>,
    changes: &Map<String, Value>,
) -> ProtocolResult<Map<String, Value>> {
    for (key, change) in changes {
        match change {
            Value::Array(items) if items.is_empty() => {
                if base.remove(key).is_none() {
                    return Err(ProtocolError::invalid_delta(format!(
                        "cannot remove missing key {key:?}"
                    )));
                }
            }
            Value::Array(items) if items.len() == 1 => {
                base.insert(key.clone(), items[0].clone());
            }
            Value::Object(nested) => match base.get_mut(key) {
                Some(Value::Object(inner)) => {
                    let merged = apply_object(std::mem::take(inner), nested)?;
                    *inner = merged;
                }
                _ => {
                    return Err(ProtocolError::invalid_delta(format!(
                        "nested delta for non-object key {key:?}"
                    )));
                }
            },
            _ => {
                return Err(ProtocolError::invalid_delta(format!(
                    "malformed change for key {key:?}"
                )));
            }
        }
    }
    Ok(base)
}
