use serde::{Deserialize, Serialize};

/// When a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// Repeat every `every_ms` milliseconds.
    Every { every_ms: u64 },
    /// 5-field cron expression evaluated in the configured timezone.
    Cron { expr: String },
    /// Fire once at an absolute unix-millisecond instant.
    At { at_ms: i64 },
}

/// What the job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    #[default]
    Message,
    TaskRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronPayload {
    #[serde(default)]
    pub kind: PayloadKind,
    pub message: String,
    #[serde(default)]
    pub task_name: Option<String>,
    /// When true, the fired message is delivered straight to `channel`/`to`;
    /// otherwise it is handed to the agent on the background lane.
    #[serde(default)]
    pub deliver: bool,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub delete_after_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronJobState {
    pub next_run_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_serializes_with_kind_tag() {
        let every = CronSchedule::Every { every_ms: 5000 };
        let json = serde_json::to_value(&every).unwrap();
        assert_eq!(json["kind"], "every");
        assert_eq!(json["every_ms"], 5000);

        let expr = CronSchedule::Cron { expr: "0 9 * * *".into() };
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["kind"], "cron");
        assert_eq!(json["expr"], "0 9 * * *");
    }

    #[test]
    fn payload_defaults_are_lenient() {
        let payload: CronPayload =
            serde_json::from_str(r#"{"message": "提醒喝水"}"#).unwrap();
        assert_eq!(payload.kind, PayloadKind::Message);
        assert!(!payload.deliver);
        assert!(!payload.delete_after_run);
    }
}
