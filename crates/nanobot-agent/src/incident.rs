//! Centralized runtime failure handling: persist every event, de-duplicate by
//! fingerprint in a sliding window, and escalate only when the same class of
//! failure keeps happening.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use nanobot_core::FailureStore;

use crate::failure::{FailureEvent, FailureSeverity};

pub type OnDecision = Arc<dyn Fn(&FailureEvent, &IncidentDecision) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct IncidentDecision {
    pub fingerprint: String,
    pub count_in_window: u32,
    pub should_notify_user: bool,
    pub should_escalate: bool,
}

#[derive(Debug, Clone, Copy)]
struct SeenRow {
    first_ts: i64,
    last_ts: i64,
    count: u32,
}

pub struct IncidentManager {
    dedupe_window_seconds: i64,
    escalate_threshold: u32,
    seen: Mutex<HashMap<String, SeenRow>>,
    store: FailureStore,
    on_decision: Mutex<Option<OnDecision>>,
}

impl IncidentManager {
    pub fn new(store: FailureStore, dedupe_window_seconds: i64, escalate_threshold: u32) -> Self {
        Self {
            dedupe_window_seconds: dedupe_window_seconds.max(60),
            escalate_threshold: escalate_threshold.max(2),
            seen: Mutex::new(HashMap::new()),
            store,
            on_decision: Mutex::new(None),
        }
    }

    pub fn with_defaults(store: FailureStore) -> Self {
        Self::new(store, 1800, 3)
    }

    /// Install the escalation callback (e.g. notify the origin chat).
    pub fn set_on_decision(&self, cb: OnDecision) {
        *self.on_decision.lock().expect("incident callback poisoned") = Some(cb);
    }

    /// Record one failure and decide whether to escalate.
    pub fn report(&self, event: &FailureEvent) -> IncidentDecision {
        let now = chrono::Utc::now().timestamp();
        let fp = event.resolved_fingerprint();

        let count = {
            let mut seen = self.seen.lock().expect("incident map poisoned");
            let cutoff = now - self.dedupe_window_seconds;
            seen.retain(|_, row| row.last_ts >= cutoff);

            let row = seen.entry(fp.clone()).or_insert(SeenRow {
                first_ts: now,
                last_ts: now,
                count: 0,
            });
            row.last_ts = now;
            row.count += 1;
            row.count
        };

        let mut details = event.details.clone();
        details.insert("severity".into(), Value::String(event.severity.to_string()));
        details.insert("retryable".into(), Value::Bool(event.retryable));
        details.insert("fingerprint".into(), Value::String(fp.clone()));
        details.insert("count_in_window".into(), Value::from(count));
        self.store
            .record(&event.source, &event.category, &event.summary, details);

        let severe = matches!(
            event.severity,
            FailureSeverity::Error | FailureSeverity::Critical
        );
        let should_escalate = severe && count >= self.escalate_threshold;

        warn!(
            source = %event.source,
            category = %event.category,
            severity = %event.severity,
            retryable = event.retryable,
            fingerprint = %fp,
            count,
            "incident reported"
        );

        let decision = IncidentDecision {
            fingerprint: fp,
            count_in_window: count,
            should_notify_user: should_escalate,
            should_escalate,
        };

        let callback = self.on_decision.lock().expect("incident callback poisoned").clone();
        if let Some(cb) = callback {
            // Callback failures must not leak back into the reporting path.
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| cb(event, &decision)));
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(dir: &tempfile::TempDir) -> IncidentManager {
        IncidentManager::with_defaults(FailureStore::new(dir.path().join("failures.json")))
    }

    fn error_event() -> FailureEvent {
        FailureEvent::new(
            "tool_executor",
            "tool_failed",
            "工具调用失败: read_file",
            FailureSeverity::Error,
        )
        .detail("tool", "read_file")
    }

    #[test]
    fn escalates_at_threshold_for_severe_events() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let first = mgr.report(&error_event());
        assert_eq!(first.count_in_window, 1);
        assert!(!first.should_escalate);

        mgr.report(&error_event());
        let third = mgr.report(&error_event());
        assert_eq!(third.count_in_window, 3);
        assert!(third.should_escalate);
        assert!(third.should_notify_user);
    }

    #[test]
    fn warnings_never_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let warning = FailureEvent::new("hooks", "hook_skipped", "x", FailureSeverity::Warning);
        for _ in 0..5 {
            assert!(!mgr.report(&warning).should_escalate);
        }
    }

    #[test]
    fn every_report_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path().join("failures.json"));
        let mgr = IncidentManager::with_defaults(store.clone());
        mgr.report(&error_event());
        mgr.report(&error_event());
        assert_eq!(store.list_recent(10).len(), 2);
    }

    #[test]
    fn panicking_callback_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        mgr.set_on_decision(Arc::new(move |_e, _d| {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("callback bug");
        }));
        let decision = mgr.report(&error_event());
        assert_eq!(decision.count_in_window, 1);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }
}
