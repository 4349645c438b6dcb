//! Canonical failure record reported to the incident manager.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Normalized severity across tool execution, cron, and the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    Transient,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for FailureSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureSeverity::Transient => "transient",
            FailureSeverity::Warning => "warning",
            FailureSeverity::Error => "error",
            FailureSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Detail keys that participate in the fingerprint: stable identifiers only,
/// never free text.
const STABLE_DETAIL_KEYS: &[&str] = &[
    "tool",
    "error_type",
    "error_code",
    "job_id",
    "task_name",
    "reason",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub source: String,
    pub category: String,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub severity: FailureSeverity,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl FailureEvent {
    pub fn new(
        source: impl Into<String>,
        category: impl Into<String>,
        summary: impl Into<String>,
        severity: FailureSeverity,
    ) -> Self {
        Self {
            source: source.into(),
            category: category.into(),
            summary: summary.into(),
            details: Map::new(),
            severity,
            retryable: false,
            fingerprint: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// The explicit fingerprint if set, else a 16-hex-char sha256 over the
    /// stable identity of this failure class.
    pub fn resolved_fingerprint(&self) -> String {
        if let Some(fp) = &self.fingerprint {
            return fp.clone();
        }
        let summary: String = self.summary.trim().chars().take(120).collect();
        let stable = serde_json::json!({
            "source": self.source,
            "category": self.category,
            "summary": summary,
            "details": self.normalized_details(),
        });
        let canonical = crate::loop_guard::canonical_json(&stable);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn normalized_details(&self) -> Value {
        let mut normalized = Map::new();
        for key in STABLE_DETAIL_KEYS {
            if let Some(v) = self.details.get(*key) {
                if !v.is_null() {
                    normalized.insert(key.to_string(), v.clone());
                }
            }
        }
        if normalized.is_empty() {
            let mut keys: Vec<&String> = self.details.keys().collect();
            keys.sort();
            let raw: Vec<Value> = keys
                .into_iter()
                .take(10)
                .map(|k| Value::String(k.clone()))
                .collect();
            normalized.insert("raw_keys".to_string(), Value::Array(raw));
        }
        Value::Object(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_16_hex_chars() {
        let event = FailureEvent::new("tool_executor", "tool_failed", "工具调用失败: read_file", FailureSeverity::Error)
            .detail("tool", "read_file");
        let fp = event.resolved_fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_failure_class_shares_a_fingerprint() {
        let a = FailureEvent::new("tool_executor", "tool_failed", "工具调用失败: x", FailureSeverity::Error)
            .detail("tool", "x")
            .detail("trace_id", "volatile-1");
        let b = FailureEvent::new("tool_executor", "tool_failed", "工具调用失败: x", FailureSeverity::Error)
            .detail("tool", "x")
            .detail("trace_id", "volatile-2");
        // trace_id is not a stable key, so it must not split the class.
        assert_eq!(a.resolved_fingerprint(), b.resolved_fingerprint());
    }

    #[test]
    fn explicit_fingerprint_wins() {
        let mut event =
            FailureEvent::new("cron", "job_error", "x", FailureSeverity::Warning);
        event.fingerprint = Some("deadbeefdeadbeef".to_string());
        assert_eq!(event.resolved_fingerprint(), "deadbeefdeadbeef");
    }

    #[test]
    fn long_summaries_are_truncated_for_identity() {
        let long_a = format!("prefix {}", "a".repeat(300));
        let long_b = format!("prefix {}{}", "a".repeat(300), "different tail");
        let a = FailureEvent::new("s", "c", long_a, FailureSeverity::Error);
        let b = FailureEvent::new("s", "c", long_b, FailureSeverity::Error);
        assert_eq!(a.resolved_fingerprint(), b.resolved_fingerprint());
    }
}
