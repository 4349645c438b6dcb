//! Durable runtime-failure queue: `<data>/runtime/failures.json`, bounded to
//! the most recent 200 events, readable by `status` / `health` and by the
//! agent itself.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::paths::atomic_write_json;

const MAX_RETAINED: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub ts: String,
    pub source: String,
    pub category: String,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FailureDocument {
    #[serde(default)]
    items: Vec<FailureRecord>,
}

/// Bounded persistent failure store.
#[derive(Debug, Clone)]
pub struct FailureStore {
    path: PathBuf,
}

impl FailureStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_location() -> Self {
        Self::new(crate::paths::runtime_failures_path())
    }

    /// Append one failure, trimming to the retention cap. Write errors are
    /// swallowed; losing a diagnostics entry must not cascade.
    pub fn record(
        &self,
        source: &str,
        category: &str,
        summary: &str,
        details: Map<String, Value>,
    ) {
        let mut doc = self.load();
        doc.items.push(FailureRecord {
            ts: chrono::Utc::now().to_rfc3339(),
            source: source.to_string(),
            category: category.to_string(),
            summary: summary.trim().chars().take(500).collect(),
            details,
        });
        let overflow = doc.items.len().saturating_sub(MAX_RETAINED);
        if overflow > 0 {
            doc.items.drain(..overflow);
        }
        let _ = atomic_write_json(&self.path, &doc);
    }

    /// Most recent failures, newest first.
    pub fn list_recent(&self, limit: usize) -> Vec<FailureRecord> {
        if limit == 0 {
            return Vec::new();
        }
        let doc = self.load();
        doc.items.into_iter().rev().take(limit).collect()
    }

    /// Human-readable digest of the latest failures for status output.
    pub fn summarize_recent(&self, limit: usize) -> String {
        let items = self.list_recent(limit);
        if items.is_empty() {
            return "近期无运行失败事件。".to_string();
        }
        items
            .iter()
            .enumerate()
            .map(|(i, it)| {
                let ts: String = it.ts.chars().take(19).collect();
                format!(
                    "{}. [{}] {}/{}: {}",
                    i + 1,
                    ts.replace('T', " "),
                    it.source,
                    it.category,
                    it.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn load(&self) -> FailureDocument {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return FailureDocument::default();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }
}
