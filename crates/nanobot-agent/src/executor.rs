//! Tool execution wrapper: argument coercion, repeat-failure interception,
//! hook emission, error refinement, and incident reporting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use nanobot_hooks::{
    HookEvent, HookRegistry, ToolAfterPayload, ToolBeforePayload, ToolErrorPayload,
};

use crate::failure::{FailureEvent, FailureSeverity};
use crate::incident::IncidentManager;
use crate::loop_guard::tool_call_hash;
use crate::tools::{ToolRegistry, ToolResult};

/// Channel/session identity of the turn currently executing tools, merged
/// into incident details.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub trace_id: Option<String>,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct FailedMeta {
    ts: i64,
    count: u32,
}

/// Failed-call history. FIFO order and per-hash metadata are co-mutated here,
/// behind one lock, so TTL pruning and capacity eviction cannot diverge.
#[derive(Default)]
struct FailedCalls {
    order: VecDeque<String>,
    meta: HashMap<String, FailedMeta>,
}

impl FailedCalls {
    fn prune(&mut self, now: i64, ttl_seconds: i64) {
        let expired: Vec<String> = self
            .meta
            .iter()
            .filter(|(_, m)| now - m.ts > ttl_seconds)
            .map(|(h, _)| h.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for hash in &expired {
            self.meta.remove(hash);
        }
        self.order.retain(|h| !expired.contains(h));
    }

    fn contains(&self, hash: &str) -> bool {
        self.meta.contains_key(hash)
    }

    /// Record a failure, returning whether this hash had already failed.
    fn record(&mut self, hash: &str, now: i64, capacity: usize) -> bool {
        let repeat = self.meta.contains_key(hash);
        let entry = self.meta.entry(hash.to_string()).or_insert(FailedMeta { ts: now, count: 0 });
        entry.ts = now;
        entry.count += 1;
        if !repeat {
            self.order.push_back(hash.to_string());
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.meta.remove(&oldest);
            }
        }
        repeat
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    failed: Mutex<FailedCalls>,
    max_failed_history: usize,
    failed_ttl_seconds: i64,
    hooks: Arc<HookRegistry>,
    incidents: Option<Arc<IncidentManager>>,
    runtime: Mutex<RuntimeContext>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        incidents: Option<Arc<IncidentManager>>,
    ) -> Self {
        Self {
            registry,
            failed: Mutex::new(FailedCalls::default()),
            max_failed_history: 100,
            failed_ttl_seconds: 600,
            hooks,
            incidents,
            runtime: Mutex::new(RuntimeContext::default()),
        }
    }

    pub fn set_runtime_context(&self, ctx: RuntimeContext) {
        *self.runtime.lock().expect("runtime context poisoned") = ctx;
    }

    pub fn clear_runtime_context(&self) {
        *self.runtime.lock().expect("runtime context poisoned") = RuntimeContext::default();
    }

    /// True when this exact call is currently in the failed set.
    pub fn is_failed_call(&self, name: &str, params: &Value) -> bool {
        let hash = tool_call_hash(name, params);
        self.failed
            .lock()
            .expect("failed set poisoned")
            .contains(&hash)
    }

    pub async fn execute(&self, name: &str, params: Value) -> ToolResult {
        let call_hash = tool_call_hash(name, &params);
        self.hooks.emit(&HookEvent::ToolBefore(ToolBeforePayload {
            tool: name.to_string(),
            params: params.clone(),
            call_hash: call_hash.clone(),
        }));

        let now = chrono::Utc::now().timestamp();

        // Repeat-failure interception with TTL.
        let intercepted = {
            let mut failed = self.failed.lock().expect("failed set poisoned");
            failed.prune(now, self.failed_ttl_seconds);
            failed.contains(&call_hash)
        };
        if intercepted {
            warn!(tool = %name, hash = %&call_hash[..8], "intercepted repeat failure");
            self.report_incident(
                FailureEvent::new(
                    "tool_executor",
                    "repeat_failure_intercepted",
                    format!("重复失败调用被拦截: {name}"),
                    FailureSeverity::Warning,
                )
                .detail("tool", name)
                .detail("reason", "repeat_failure")
                .detail("call_hash", &call_hash[..16]),
            );
            let result = ToolResult::fail(format!(
                "Blocked: 您刚才已经尝试过使用相同的参数调用工具 '{name}' 且失败了。\n\
                 请不要重复完全相同的操作（参数匹配）。您必须修改参数（例如路径、选项）或尝试其他方案。\n\
                 当前重复的参数: {params}"
            ))
            .with_remedy("请检查参数是否由于路径错误或权限问题导致之前执行失败，并尝试修正它们。");
            self.hooks.emit(&HookEvent::ToolAfter(ToolAfterPayload {
                tool: name.to_string(),
                params,
                call_hash,
                success: false,
                severity: Some(result.severity.to_string()),
                blocked: true,
            }));
            return result;
        }

        // Coerce argument types against the declared schema before executing.
        let params = match self.registry.get(name) {
            Some(tool) => sanitize_params(params, &tool.parameters()),
            None => params,
        };

        let exec = std::panic::AssertUnwindSafe(self.registry.execute(name, params.clone()))
            .catch_unwind()
            .await;

        let mut result = match exec {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(tool = %name, panic = %detail, "tool executor panicked");
                self.report_incident(
                    FailureEvent::new(
                        "tool_executor",
                        "tool_executor_exception",
                        format!("工具执行器内部异常: {name}"),
                        FailureSeverity::Critical,
                    )
                    .detail("tool", name)
                    .detail("error_type", "panic")
                    .detail("reason", "executor_exception"),
                );
                self.hooks.emit(&HookEvent::ToolError(ToolErrorPayload {
                    tool: name.to_string(),
                    params: params.clone(),
                    call_hash: call_hash.clone(),
                    error: detail.clone(),
                }));
                return ToolResult::fail(format!("Error: 内部系统错误 (panic: {detail})。"))
                    .with_remedy("建议检查您的指令输入语法，或稍后重试。若问题持续，请联系管理员。");
            }
        };

        if !result.success {
            let is_repeat = {
                let mut failed = self.failed.lock().expect("failed set poisoned");
                failed.record(&call_hash, now, self.max_failed_history)
            };

            let refined = refine_error(name, &params, &result.output);
            result.output = if is_repeat || result.remedy.is_some() {
                format!(
                    "[Note: 工具执行失败。在下一步之前，请先对此次失败进行反思（Thought），寻找根因并修正。]\n{refined}"
                )
            } else {
                refined
            };

            self.hooks.emit(&HookEvent::ToolAfter(ToolAfterPayload {
                tool: name.to_string(),
                params,
                call_hash,
                success: false,
                severity: Some(result.severity.to_string()),
                blocked: false,
            }));
            self.report_incident(
                FailureEvent::new(
                    "tool_executor",
                    "tool_failed",
                    format!("工具调用失败: {name}"),
                    FailureSeverity::Error,
                )
                .retryable(result.should_retry)
                .detail("tool", name)
                .detail("reason", "tool_result_failed")
                .detail("error_type", result.severity.to_string()),
            );
            return result;
        }

        self.hooks.emit(&HookEvent::ToolAfter(ToolAfterPayload {
            tool: name.to_string(),
            params,
            call_hash,
            success: true,
            severity: Some(result.severity.to_string()),
            blocked: false,
        }));
        result
    }

    fn report_incident(&self, mut event: FailureEvent) {
        let Some(incidents) = &self.incidents else {
            return;
        };
        {
            let runtime = self.runtime.lock().expect("runtime context poisoned");
            let pairs = [
                ("channel", runtime.channel.clone()),
                ("chat_id", runtime.chat_id.clone()),
                ("trace_id", runtime.trace_id.clone()),
                ("session_key", runtime.session_key.clone()),
            ];
            for (key, value) in pairs {
                if let Some(v) = value {
                    event.details.entry(key.to_string()).or_insert(Value::String(v));
                }
            }
        }
        incidents.report(&event);
    }
}

/// Coerce model-supplied arguments to the declared schema types.
/// Required fields are never dropped, only converted where trivially possible.
fn sanitize_params(params: Value, schema: &Value) -> Value {
    let Value::Object(map) = params else {
        return params;
    };
    let properties = schema.get("properties").and_then(Value::as_object);
    let Some(properties) = properties else {
        return Value::Object(map);
    };

    let mut sanitized = serde_json::Map::new();
    for (key, value) in map {
        let Some(prop) = properties.get(&key) else {
            sanitized.insert(key, value);
            continue;
        };

        // Enum stabilization: a single-element list where a member was meant.
        if prop.get("enum").is_some() {
            if let Value::Array(items) = &value {
                if let Some(first) = items.first() {
                    sanitized.insert(key, Value::String(stringify(first)));
                    continue;
                }
            }
            sanitized.insert(key, value);
            continue;
        }

        let coerced = match prop.get("type").and_then(Value::as_str) {
            Some("string") if !value.is_string() => Value::String(stringify(&value)),
            Some("integer") if !value.is_i64() && !value.is_u64() => match &value {
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or(value),
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::from(f as i64))
                    .unwrap_or(value),
                _ => value,
            },
            Some("boolean") if !value.is_boolean() => {
                match stringify(&value).to_lowercase().as_str() {
                    "true" | "1" | "yes" => Value::Bool(true),
                    "false" | "0" | "no" => Value::Bool(false),
                    _ => value,
                }
            }
            _ => value,
        };
        sanitized.insert(key, coerced);
    }
    Value::Object(sanitized)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn known failure shapes into AI-actionable instructions.
fn refine_error(_name: &str, params: &Value, raw_error: &str) -> String {
    let lower = raw_error.to_lowercase();

    if lower.contains("filenotfounderror") || lower.contains("not found") {
        let path = ["path", "image_path", "target", "filename", "file"]
            .iter()
            .find_map(|k| params.get(*k).and_then(Value::as_str))
            .unwrap_or("未知路径");
        return format!(
            "{raw_error}\n建议：在使用文件相关工具前，请确认路径 '{path}' 是否正确。您可以先调用 'list_dir' 查看当前目录内容。"
        );
    }
    if lower.contains("invalid parameters") || lower.contains("should be") {
        return format!(
            "{raw_error}\n建议：您的参数格式或类型似乎不正确。请仔细对比工具定义的 JSON Schema（尤其是 type 和 enum 限制）。"
        );
    }
    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return format!(
            "{raw_error}\n建议：权限被拒绝。请确保操作路径在工作目录内，或检查您是否有权访问该资源。"
        );
    }
    if lower.contains("exit status") || lower.contains("command failed") {
        return format!("{raw_error}\n建议：外部命令执行失败。请检查语法或依赖项是否完整。");
    }
    raw_error.to_string()
}
