//! The `cron` tool: let the model schedule reminders and recurring work.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use nanobot_cron::{CronPayload, CronSchedule, CronService, PayloadKind};

use super::{DeliveryContext, Tool, ToolResult};

pub struct CronTool {
    cron: Arc<CronService>,
    context: Mutex<Option<(String, String)>>,
}

impl CronTool {
    pub fn new(cron: Arc<CronService>) -> Self {
        Self {
            cron,
            context: Mutex::new(None),
        }
    }

    fn add_job(
        &self,
        message: &str,
        task_name: Option<&str>,
        every_seconds: Option<i64>,
        cron_expr: Option<&str>,
        in_seconds: Option<i64>,
    ) -> Result<String, String> {
        if message.is_empty() && task_name.is_none() {
            return Err("message or task_name is required for add".to_string());
        }
        let Some((channel, chat_id)) = self.context.lock().expect("cron context poisoned").clone()
        else {
            return Err("no session context (channel/chat_id)".to_string());
        };

        let provided =
            [every_seconds.is_some(), cron_expr.is_some(), in_seconds.is_some()];
        if provided.iter().filter(|p| **p).count() != 1 {
            return Err(
                "exactly one of every_seconds, cron_expr, or in_seconds is required".to_string(),
            );
        }
        if every_seconds.is_some_and(|s| s <= 0) {
            return Err("every_seconds must be > 0".to_string());
        }
        if in_seconds.is_some_and(|s| s <= 0) {
            return Err("in_seconds must be > 0".to_string());
        }

        let (kind, message) = match task_name {
            Some(task) => (
                PayloadKind::TaskRun,
                format!("请调用 task 工具执行任务，name=\"{task}\""),
            ),
            None => (PayloadKind::Message, message.to_string()),
        };

        let (schedule, delete_after_run) = if let Some(secs) = every_seconds {
            (CronSchedule::Every { every_ms: secs as u64 * 1000 }, false)
        } else if let Some(expr) = cron_expr {
            (CronSchedule::Cron { expr: expr.to_string() }, false)
        } else {
            let at_ms =
                chrono::Utc::now().timestamp_millis() + in_seconds.unwrap_or(0) * 1000;
            (CronSchedule::At { at_ms }, true)
        };

        let name: String = message.chars().take(30).collect();
        let job = self
            .cron
            .add_job(
                &name,
                schedule,
                CronPayload {
                    kind,
                    message,
                    task_name: task_name.map(str::to_string),
                    deliver: true,
                    channel: Some(channel),
                    to: Some(chat_id),
                    delete_after_run,
                },
            )
            .map_err(|e| e.to_string())?;
        Ok(format!("Created job '{}' (id: {})", job.name, job.id))
    }

    fn list_jobs(&self) -> String {
        let jobs = self.cron.list_jobs();
        if jobs.is_empty() {
            return "No scheduled jobs.".to_string();
        }
        let fmt_ts = |ms: Option<i64>| -> String {
            match ms {
                Some(ms) => chrono::DateTime::from_timestamp_millis(ms)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                None => "-".to_string(),
            }
        };
        let mut lines = vec!["Scheduled jobs:".to_string()];
        for j in jobs {
            let sched = match &j.schedule {
                CronSchedule::Every { every_ms } => format!("every {}s", every_ms / 1000),
                CronSchedule::Cron { expr } => format!("cron {expr}"),
                CronSchedule::At { at_ms } => format!("at {}", fmt_ts(Some(*at_ms))),
            };
            lines.push(format!("- {} (id: {})", j.name, j.id));
            lines.push(format!("  enabled: {} | schedule: {}", j.enabled, sched));
            lines.push(format!(
                "  next_run: {} | last_run: {}",
                fmt_ts(j.state.next_run_at_ms),
                fmt_ts(j.state.last_run_at_ms)
            ));
            lines.push(format!(
                "  deliver: {} | channel: {} | to: {}",
                j.payload.deliver,
                j.payload.channel.as_deref().unwrap_or("-"),
                j.payload.to.as_deref().unwrap_or("-")
            ));
            if let Some(task) = &j.payload.task_name {
                lines.push(format!("  task: {task}"));
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule reminders and recurring tasks. Actions: add, list, remove."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Action to perform"
                },
                "message": {"type": "string", "description": "Reminder message (for add)"},
                "task_name": {"type": "string", "description": "任务名称(如果提供, 将调度该任务的执行)"},
                "every_seconds": {"type": "integer", "description": "Interval in seconds (for recurring tasks)"},
                "cron_expr": {"type": "string", "description": "Cron expression like '0 9 * * *' (for scheduled tasks)"},
                "in_seconds": {"type": "integer", "description": "Run once after X seconds (for one-off reminders)"},
                "job_id": {"type": "string", "description": "Job ID (for remove)"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let action = params["action"].as_str().unwrap_or_default();
        match action {
            "add" => {
                let outcome = self.add_job(
                    params["message"].as_str().unwrap_or_default(),
                    params["task_name"].as_str(),
                    params["every_seconds"].as_i64(),
                    params["cron_expr"].as_str(),
                    params["in_seconds"].as_i64(),
                );
                match outcome {
                    Ok(msg) => ToolResult::ok(msg),
                    Err(e) => ToolResult::fail(format!("Error: {e}")).with_remedy(
                        "请检查参数，确保提供了 message 或 task_name，且有且只有一个时间调度参数。",
                    ),
                }
            }
            "list" => ToolResult::ok(self.list_jobs()),
            "remove" => match params["job_id"].as_str() {
                Some(id) if self.cron.remove_job(id) => {
                    ToolResult::ok(format!("Removed job {id}"))
                }
                Some(id) => ToolResult::fail(format!("Job {id} not found"))
                    .with_remedy("请检查 job_id 是否正确。"),
                None => ToolResult::fail("Error: job_id is required for remove"),
            },
            other => ToolResult::fail(format!("Unknown action: {other}")),
        }
    }

    fn set_context(&self, ctx: &DeliveryContext) {
        *self.context.lock().expect("cron context poisoned") =
            Some((ctx.channel.clone(), ctx.chat_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_core::AuditLog;
    use nanobot_cron::CronStore;

    fn tool(dir: &tempfile::TempDir) -> CronTool {
        let store = CronStore::new(dir.path().join("jobs.json"));
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let svc = Arc::new(CronService::new(store, "Asia/Shanghai".parse().unwrap(), audit));
        let tool = CronTool::new(svc);
        tool.set_context(&DeliveryContext {
            channel: "telegram".into(),
            chat_id: "42".into(),
            session_key: "telegram:42".into(),
            trace_id: None,
        });
        tool
    }

    #[tokio::test]
    async fn add_then_list_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(&dir);

        let added = tool
            .execute(json!({"action": "add", "message": "喝水", "every_seconds": 600}))
            .await;
        assert!(added.success, "{}", added.output);

        let listed = tool.execute(json!({"action": "list"})).await;
        assert!(listed.output.contains("喝水"));
        assert!(listed.output.contains("every 600s"));

        let id = listed
            .output
            .lines()
            .find_map(|l| l.split("(id: ").nth(1))
            .unwrap()
            .trim_end_matches(')')
            .to_string();
        let removed = tool.execute(json!({"action": "remove", "job_id": id})).await;
        assert!(removed.success);
    }

    #[tokio::test]
    async fn add_requires_exactly_one_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(&dir);
        let both = tool
            .execute(json!({
                "action": "add", "message": "x",
                "every_seconds": 60, "in_seconds": 60
            }))
            .await;
        assert!(!both.success);
        assert!(both.output.contains("exactly one"));

        let neither = tool.execute(json!({"action": "add", "message": "x"})).await;
        assert!(!neither.success);
    }

    #[tokio::test]
    async fn in_seconds_creates_self_deleting_job() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(&dir);
        let added = tool
            .execute(json!({"action": "add", "message": "once", "in_seconds": 120}))
            .await;
        assert!(added.success);
        let jobs = tool.cron.list_jobs();
        assert!(jobs[0].payload.delete_after_run);
        assert!(matches!(jobs[0].schedule, CronSchedule::At { .. }));
    }
}
