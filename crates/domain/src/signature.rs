//! Tool-call signatures.
//!
//! Providers regenerate tool-call ids on every re-emission, so a
//! decision recorded against an id from one model response cannot be
//! matched by id on the next. The signature — a hash of the tool name
//! and the canonically sorted arguments — is stable across id churn
//! and is what the approval store rehydrates against.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::message::ToolCall;

/// Deterministic signature of `(name, canonical(arguments))`.
pub fn tool_call_signature(call: &ToolCall) -> String {
    signature_of(&call.name, &call.arguments)
}

/// Signature from raw parts; used when no [`ToolCall`] value exists yet.
pub fn signature_of(name: &str, arguments: &str) -> String {
    let canonical = match serde_json::from_str::<Value>(arguments) {
        Ok(v) => canonical_json(&v),
        // Unparseable arguments still get a stable signature.
        Err(_) => arguments.trim().to_string(),
    };
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with object keys sorted recursively.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
