//! JSONL audit log. One event per line: `{"ts":"<iso>","type":<event>,...}`.

use std::io::Write;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

/// Append-only audit event writer. Failures never propagate; a broken audit
/// log must not take a tool call down with it.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Open the default audit log under the data directory.
    pub fn default_location() -> Self {
        Self::new(crate::paths::audit_path())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one event, stamping `ts` if the caller did not.
    pub fn log_event(&self, event: Value) {
        let mut payload = match event {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("event".to_string(), other);
                map
            }
        };
        payload
            .entry("ts".to_string())
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));

        if let Err(e) = self.append_line(&Value::Object(payload)) {
            debug!("audit log write failed: {e}");
        }
    }

    fn append_line(&self, value: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(value).unwrap_or_default();
        writeln!(file, "{line}")
    }

    /// Read the last `limit` events, oldest first. Malformed lines are skipped.
    pub fn tail(&self, limit: usize) -> Vec<Value> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let events: Vec<Value> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }
}
