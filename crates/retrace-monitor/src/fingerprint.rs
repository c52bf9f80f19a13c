//! Deterministic request fingerprints used as stub-map keys.

use retrace_core::ModelRequest;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// Fingerprint of a model request over `(messages, system, config)`.
///
/// Object keys are sorted at every depth, so two requests that differ only
/// in key insertion order share a fingerprint. Message order is significant.
pub fn fingerprint_request(request: &ModelRequest) -> String {
    let messages = serde_json::to_value(&request.messages).unwrap_or(Value::Null);
    let payload = json!({
        "messages": messages,
        "system": request.system,
        "config": Value::Object(request.config.clone()),
    });
    digest(&payload)
}

/// Content fingerprint of a tool invocation, used when no correlation id exists.
pub fn fingerprint_tool(tool_name: &str, input: &Value) -> String {
    let payload = json!({
        "tool": tool_name,
        "input": input,
    });
    format!("tool:{}", digest(&payload))
}

fn digest(payload: &Value) -> String {
    let canonical = canonicalize(payload).to_string();
    let hash = Sha256::digest(canonical.as_bytes());
    let mut encoded = hex::encode(hash);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

/// Rebuilds `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
