use serde_json::{Map, Value};

use crate::action::ActionDescriptor;

/// Render a JSON value with object keys sorted recursively. Caller key
/// order must never influence the derived key.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(*key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical single-line rendering of an action's parameters.
pub fn canonical_parameters(parameters: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_canonical(&Value::Object(parameters.clone()), &mut out);
    out
}

/// Derive the cache key for an action: SHA-256 over the identity fields
/// and the canonicalized parameters. Two logically-identical actions hash
/// to the same key regardless of parameter ordering.
pub fn derive_key(action: &ActionDescriptor) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(action.correlation_id.as_bytes());
    hasher.update(b"|");
    hasher.update(action.action_type.as_bytes());
    hasher.update(b"|");
    hasher.update(action.target.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_parameters(&action.parameters).as_bytes());
    format!("{:x}", hasher.finalize())
}
