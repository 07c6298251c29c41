//! Merge rules for free-form JSON fields such as affinity and label selectors

use serde_json::Value;

use super::{Merge, MergeError};

/// Name of a JSON value's shape, used in mismatch errors
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

impl Merge for Value {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        match (&mut *self, other) {
            (_, Value::Null) => Ok(()),
            (current @ Value::Null, incoming) => {
                *current = incoming.clone();
                Ok(())
            }
            (Value::Object(existing), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    match existing.get_mut(key) {
                        Some(current) => current.merge_from(value).map_err(|e| e.within(key))?,
                        None => {
                            existing.insert(key.clone(), value.clone());
                        }
                    }
                }
                Ok(())
            }
            // Free-form arrays carry no merge key, so they are replaced whole
            (Value::Array(existing), Value::Array(incoming)) => {
                if !incoming.is_empty() {
                    existing.clone_from(incoming);
                }
                Ok(())
            }
            (current, incoming) if kind(current) == kind(incoming) => {
                *current = incoming.clone();
                Ok(())
            }
            (current, incoming) => Err(MergeError::mismatch(kind(current), kind(incoming))),
        }
    }
}
