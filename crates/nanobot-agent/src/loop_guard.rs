//! Loop-guard helpers: stable tool-call hashes and the repeat-window counter
//! shared by the executor and the turn engine.

use serde_json::Value;
use sha2::{Digest, Sha256};

use nanobot_providers::ToolCallRequest;

/// Canonical JSON: object keys sorted recursively so argument order never
/// changes the hash.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Stable hash for one tool call: sha256 over `"{name}:{canonical(args)}"`.
/// Equal hash ⇒ same call for loop detection and repeat-failure interception.
pub fn tool_call_hash(name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(arguments).as_bytes());
    hex::encode(hasher.finalize())
}

/// Ids and hashes for a batch of tool calls. Empty ids are dropped.
pub fn collect_call_ids_and_hashes(calls: &[ToolCallRequest]) -> (Vec<String>, Vec<String>) {
    let ids = calls
        .iter()
        .filter(|c| !c.id.is_empty())
        .map(|c| c.id.clone())
        .collect();
    let hashes = calls
        .iter()
        .map(|c| tool_call_hash(&c.name, &c.arguments))
        .collect();
    (ids, hashes)
}

/// True when every current hash already appeared in the seen window.
pub fn is_hash_loop(current: &[String], seen: &std::collections::HashSet<String>) -> bool {
    !current.is_empty() && current.iter().all(|h| seen.contains(h))
}

/// True when every current id already appeared in the seen window.
pub fn is_id_loop(current: &[String], seen: &std::collections::HashSet<String>) -> bool {
    !current.is_empty() && current.iter().all(|i| seen.contains(i))
}

/// Counts consecutive identical batch signatures across iterations.
#[derive(Debug, Default)]
pub struct RepeatWindow {
    last_signature: Option<String>,
    repeat_count: u32,
}

impl RepeatWindow {
    pub fn update(&mut self, signature: &str) -> u32 {
        if self.last_signature.as_deref() == Some(signature) {
            self.repeat_count += 1;
        } else {
            self.last_signature = Some(signature.to_string());
            self.repeat_count = 1;
        }
        self.repeat_count
    }
}
