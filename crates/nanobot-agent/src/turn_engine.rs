//! The turn engine: drive one conversational turn through the bounded
//! tool-call loop with loop detection, budget enforcement, context
//! compaction, and forced-summary finalization.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use nanobot_core::types::{ChatMessage, Role};
use nanobot_core::AuditLog;
use nanobot_hooks::{
    HookEvent, HookRegistry, TurnEndPayload, TurnIterationEndPayload, TurnIterationStartPayload,
};
use nanobot_providers::{ProviderRouter, ToolCallRequest};

use crate::context::{add_assistant_message, add_tool_result};
use crate::context_guard::ContextGuard;
use crate::executor::ToolExecutor;
use crate::loop_guard::{collect_call_ids_and_hashes, is_hash_loop, is_id_loop, RepeatWindow};
use crate::parse::TextCallParser;
use crate::policy::ToolPolicy;
use crate::tools::{ToolRegistry, ToolResult, ToolSeverity};

/// Messages sent back to the channel keep at most this much tool output.
const MAX_TOOL_RESULT_CHARS: usize = 10_000;

/// How many recent messages compaction keeps verbatim.
const KEEP_RECENT: usize = 10;

/// Forced-summary provider call budget.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(12);

/// Per-trace registries are capped at this many entries (LRU eviction).
const TRACE_CACHE_CAP: usize = 200;

/// Tool-call arguments the model must not invent for context-sensitive asks.
const SENSITIVE_LABELS: &[(&str, &str)] = &[
    ("location", "地点"),
    ("city", "城市"),
    ("region", "地区"),
    ("province", "省份"),
    ("country", "国家"),
    ("timezone", "时区"),
];

const INFERENCE_HINTS: &[&str] = &["默认", "按上次", "沿用", "你决定", "随便", "任意"];

const CONTEXT_SENSITIVE_KEYWORDS: &[&str] = &[
    "天气", "温度", "降雨", "空气质量", "穿衣", "出行", "路线", "导航", "附近", "餐厅", "酒店",
    "机票", "火车",
];

/// Per-turn behaviour switches. User turns enable everything; system turns
/// run conservative.
#[derive(Debug, Clone, Copy)]
pub struct TurnFlags {
    pub parse_calls_from_text: bool,
    pub include_severity: bool,
    pub parallel_tool_exec: bool,
    pub compact_after_tools: bool,
}

impl TurnFlags {
    pub fn user_turn() -> Self {
        Self {
            parse_calls_from_text: true,
            include_severity: true,
            parallel_tool_exec: true,
            compact_after_tools: true,
        }
    }

    pub fn system_turn() -> Self {
        Self {
            parse_calls_from_text: false,
            include_severity: false,
            parallel_tool_exec: false,
            compact_after_tools: false,
        }
    }
}

/// Tool-call counts for one finished turn, read by the user turn service.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Hard limits for one turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub max_iterations: usize,
    pub max_total_tool_calls: usize,
    pub max_turn_seconds: u64,
}

/// `trace_id → T` with insertion-order eviction.
struct BoundedTraceMap<T> {
    order: VecDeque<String>,
    map: HashMap<String, T>,
}

impl<T> BoundedTraceMap<T> {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            map: HashMap::new(),
        }
    }

    fn insert(&mut self, key: String, value: T) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > TRACE_CACHE_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn pop(&mut self, key: &str) -> Option<T> {
        self.order.retain(|k| k != key);
        self.map.remove(key)
    }
}

pub struct TurnEngine {
    router: Arc<ProviderRouter>,
    executor: Arc<ToolExecutor>,
    registry: Arc<ToolRegistry>,
    policy: ToolPolicy,
    hooks: Arc<HookRegistry>,
    audit: AuditLog,
    parser: TextCallParser,
    model: String,
    max_iterations: usize,
    max_total_tool_calls: usize,
    max_turn_seconds: u64,
    per_tool_limits: HashMap<String, usize>,
    self_correction_prompt: String,
    loop_break_reply: String,
    trace_tools: Mutex<BoundedTraceMap<Vec<String>>>,
    trace_reports: Mutex<BoundedTraceMap<ExecutionReport>>,
    token_re: Regex,
}

impl TurnEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<ProviderRouter>,
        executor: Arc<ToolExecutor>,
        registry: Arc<ToolRegistry>,
        policy: ToolPolicy,
        hooks: Arc<HookRegistry>,
        audit: AuditLog,
        model: &str,
        limits: TurnLimits,
        self_correction_prompt: &str,
        loop_break_reply: &str,
    ) -> Self {
        Self {
            router,
            executor,
            registry: Arc::clone(&registry),
            policy,
            hooks,
            audit,
            parser: TextCallParser::new(registry),
            model: model.to_string(),
            max_iterations: limits.max_iterations,
            max_total_tool_calls: limits.max_total_tool_calls,
            max_turn_seconds: limits.max_turn_seconds,
            per_tool_limits: HashMap::new(),
            self_correction_prompt: self_correction_prompt.to_string(),
            loop_break_reply: loop_break_reply.to_string(),
            trace_tools: Mutex::new(BoundedTraceMap::new()),
            trace_reports: Mutex::new(BoundedTraceMap::new()),
            token_re: Regex::new(r"[\u{4e00}-\u{9fff}]{2,}|[A-Za-z0-9_+-]{2,}")
                .expect("static regex"),
        }
    }

    /// Run one turn to completion. `messages` is mutated in place (assistant
    /// and tool messages are appended as the loop progresses).
    pub async fn run(
        &self,
        messages: &mut Vec<ChatMessage>,
        trace_id: Option<&str>,
        flags: TurnFlags,
    ) -> Option<String> {
        let mut iteration = 0usize;
        let mut final_content: Option<String> = None;
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut seen_hashes: HashSet<String> = HashSet::new();
        let mut repeat_window = RepeatWindow::default();
        let mut total_tool_calls = 0usize;
        let mut tool_call_counts: HashMap<String, usize> = HashMap::new();
        let mut failed_tools: HashSet<String> = HashSet::new();
        let mut used_tools: Vec<String> = Vec::new();
        let mut report = ExecutionReport::default();
        let deadline = Instant::now() + Duration::from_secs(self.max_turn_seconds);

        while iteration < self.max_iterations {
            if Instant::now() >= deadline {
                final_content = Some(
                    self.finalize_after_budget(
                        messages,
                        &format!("单轮处理超时（>{}s）", self.max_turn_seconds),
                    )
                    .await,
                );
                self.emit_iteration_end(trace_id, iteration, "turn_timeout", 0);
                break;
            }

            iteration += 1;
            self.hooks
                .emit(&HookEvent::TurnIterationStart(TurnIterationStartPayload {
                    trace_id: trace_id.map(str::to_string),
                    iteration,
                    max_iterations: self.max_iterations,
                }));
            if let Some(tid) = trace_id {
                debug!(trace_id = %tid, iteration, "starting iteration");
            }

            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(500));
            let tools = self.policy.filter_tools(
                messages,
                self.registry.definitions(),
                &failed_tools,
            );
            let response =
                match tokio::time::timeout(remaining, self.router.chat_with_failover(messages, &tools))
                    .await
                {
                    Ok(response) => response,
                    Err(_) => {
                        final_content = Some(
                            self.finalize_after_budget(
                                messages,
                                &format!("模型响应超时（>{}s）", self.max_turn_seconds),
                            )
                            .await,
                        );
                        self.emit_iteration_end(trace_id, iteration, "model_timeout", 0);
                        break;
                    }
                };

            let mut tool_calls = response.tool_calls.clone();
            if tool_calls.is_empty() && flags.parse_calls_from_text {
                if let Some(content) = &response.content {
                    tool_calls = self.parser.parse(content);
                }
            }
            let batch_size = tool_calls.len();

            if tool_calls.is_empty() {
                final_content = response.content.clone();
                self.emit_iteration_end(trace_id, iteration, "final_text", 0);
                break;
            }

            if let Some(clarification) = self.clarification_needed(messages, &tool_calls) {
                final_content = Some(clarification);
                self.emit_iteration_end(trace_id, iteration, "clarification_required", batch_size);
                break;
            }

            if let Some(reason) = self.tool_budget_reason(
                &tool_calls,
                total_tool_calls,
                &tool_call_counts,
            ) {
                final_content = Some(self.finalize_after_budget(messages, &reason).await);
                self.emit_iteration_end(trace_id, iteration, "budget_limited", batch_size);
                break;
            }

            let (current_ids, current_hashes) = collect_call_ids_and_hashes(&tool_calls);
            let signature = {
                let mut sorted = current_hashes.clone();
                sorted.sort();
                sorted.join(",")
            };
            let repeat_count = repeat_window.update(&signature);
            let is_strict_loop = iteration > 3
                && repeat_count >= 3
                && (is_id_loop(&current_ids, &seen_ids)
                    || is_hash_loop(&current_hashes, &seen_hashes));
            if is_strict_loop {
                if iteration < self.max_iterations - 1 {
                    warn!(trace_id = ?trace_id, "loop detected, injecting self-correction prompt");
                    messages.push(ChatMessage::system(self.self_correction_prompt.clone()));
                    seen_ids.clear();
                    seen_hashes.clear();
                    self.emit_iteration_end(trace_id, iteration, "loop_corrected", batch_size);
                    continue;
                }
                error!(trace_id = ?trace_id, "permanent loop detected after retry, breaking turn");
                final_content = response
                    .content
                    .clone()
                    .filter(|c| !c.is_empty())
                    .or_else(|| Some(self.loop_break_reply.clone()));
                self.emit_iteration_end(trace_id, iteration, "loop_broken", batch_size);
                break;
            }
            seen_ids.extend(current_ids);
            seen_hashes.extend(current_hashes);

            let wire_calls: Vec<Value> = tool_calls.iter().map(|tc| tc.to_wire()).collect();
            for tc in &tool_calls {
                if !used_tools.contains(&tc.name) {
                    used_tools.push(tc.name.clone());
                }
            }
            add_assistant_message(messages, response.content.clone(), wire_calls);

            let statuses = self
                .execute_tool_calls(messages, &tool_calls, trace_id, flags)
                .await;
            for (name, success) in &statuses {
                if *success {
                    failed_tools.remove(name);
                    report.success += 1;
                } else {
                    failed_tools.insert(name.clone());
                    report.failed += 1;
                }
            }
            total_tool_calls += tool_calls.len();
            report.total = total_tool_calls;
            for tc in &tool_calls {
                *tool_call_counts.entry(tc.name.clone()).or_insert(0) += 1;
            }

            if flags.compact_after_tools {
                self.compact_messages_if_needed(messages, trace_id).await;
            }
            self.emit_iteration_end(trace_id, iteration, "tool_round_completed", batch_size);
        }

        if is_empty_like(final_content.as_deref()) {
            final_content = Some(
                self.finalize_after_budget(messages, "模型未返回有效文本，触发最终总结")
                    .await,
            );
        }

        let has_content = final_content
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false);
        self.audit.log_event(serde_json::json!({
            "type": "turn_end",
            "trace_id": trace_id,
            "iterations": iteration,
            "has_content": has_content,
        }));
        self.hooks.emit(&HookEvent::TurnEnd(TurnEndPayload {
            trace_id: trace_id.map(str::to_string),
            iterations: iteration,
            has_content,
        }));

        if let Some(tid) = trace_id {
            self.trace_tools
                .lock()
                .expect("trace tools poisoned")
                .insert(tid.to_string(), used_tools);
            self.trace_reports
                .lock()
                .expect("trace reports poisoned")
                .insert(tid.to_string(), report);
        }
        final_content
    }

    /// Ordered unique tools the traced turn actually executed.
    pub fn pop_used_tools(&self, trace_id: Option<&str>) -> Vec<String> {
        let Some(tid) = trace_id else {
            return Vec::new();
        };
        self.trace_tools
            .lock()
            .expect("trace tools poisoned")
            .pop(tid)
            .unwrap_or_default()
    }

    pub fn pop_execution_report(&self, trace_id: Option<&str>) -> ExecutionReport {
        let Some(tid) = trace_id else {
            return ExecutionReport::default();
        };
        self.trace_reports
            .lock()
            .expect("trace reports poisoned")
            .pop(tid)
            .unwrap_or_default()
    }

    /// Summarize a message window with the LLM. Returns `None` on failure so
    /// callers can skip compaction rather than corrupt history.
    pub async fn summarize_messages(&self, messages: &[ChatMessage]) -> Option<String> {
        if messages.is_empty() {
            return None;
        }
        let mut conversation = String::new();
        for m in messages {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let text: String = m.content.to_text_lossy().chars().take(1000).collect();
            conversation.push_str(&format!("{role}: {text}\n"));
        }
        let prompt = format!(
            "请将以下对话历史总结为一段简洁文字。\n\
             重点保留：关键事实、用户偏好、后续仍需记住的重要上下文。\n\
             忽略：短暂的来回确认、工具底层技术细节、无持续价值的噪音信息。\n\n\
             对话历史：\n{conversation}"
        );
        let summary_msgs = vec![
            ChatMessage::system("你是一个负责对话摘要的助手。请仅输出摘要正文。"),
            ChatMessage::user(prompt),
        ];
        let response = self.router.chat_with_failover(&summary_msgs, &[]).await;
        if response.finish_reason == "error" {
            return None;
        }
        response.content.filter(|c| !c.trim().is_empty())
    }

    fn emit_iteration_end(
        &self,
        trace_id: Option<&str>,
        iteration: usize,
        status: &str,
        tool_calls: usize,
    ) {
        self.hooks
            .emit(&HookEvent::TurnIterationEnd(TurnIterationEndPayload {
                trace_id: trace_id.map(str::to_string),
                iteration,
                status: status.to_string(),
                tool_calls,
            }));
    }

    fn tool_budget_reason(
        &self,
        tool_calls: &[ToolCallRequest],
        total_tool_calls: usize,
        tool_call_counts: &HashMap<String, usize>,
    ) -> Option<String> {
        let projected_total = total_tool_calls + tool_calls.len();
        if projected_total > self.max_total_tool_calls {
            return Some(format!(
                "总工具调用预算超限（{projected_total}/{}）",
                self.max_total_tool_calls
            ));
        }

        let mut projected = tool_call_counts.clone();
        for tc in tool_calls {
            *projected.entry(tc.name.clone()).or_insert(0) += 1;
        }
        for (tool, limit) in &self.per_tool_limits {
            let count = projected.get(tool).copied().unwrap_or(0);
            if count > *limit {
                return Some(format!("工具 {tool} 调用预算超限（{count}/{limit}）"));
            }
        }
        None
    }

    /// Deterministic local summary from the accumulated tool messages.
    fn build_forced_summary(&self, messages: &[ChatMessage], reason: &str) -> String {
        let tool_names: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.name.clone().unwrap_or_else(|| "unknown".to_string()))
            .collect();
        let mut stats: Vec<(String, usize)> = {
            let mut counts: HashMap<&String, usize> = HashMap::new();
            for name in &tool_names {
                *counts.entry(name).or_insert(0) += 1;
            }
            counts.into_iter().map(|(k, v)| (k.clone(), v)).collect()
        };
        stats.sort();

        let mut lines = vec![format!(
            "模型已超过工具调用限制，本轮已停止继续试探：{reason}。"
        )];
        if stats.is_empty() {
            lines.push("本轮未形成有效工具结果。".to_string());
        } else {
            let stats_text = stats
                .iter()
                .map(|(name, count)| format!("{name}×{count}"))
                .collect::<Vec<_>>()
                .join("，");
            lines.push(format!("本轮工具调用统计：{stats_text}"));
        }
        let recent: Vec<String> = tool_names.iter().rev().take(6).rev().cloned().collect();
        if !recent.is_empty() {
            lines.push(format!("最近步骤：{}", recent.join(" -> ")));
        }
        lines.join("\n")
    }

    /// Budget exhausted / model timed out: ask once for a final summary with
    /// tools disabled, falling back to the deterministic local summary.
    async fn finalize_after_budget(&self, messages: &[ChatMessage], reason: &str) -> String {
        let fallback = self.build_forced_summary(messages, reason);
        let summary_prompt = format!(
            "你已经触发工具调用预算限制，禁止再调用任何工具。\
             限制原因：{reason}。\
             请基于现有工具结果，直接输出给用户的最终总结：\
             1) 已完成内容 2) 当前明确结论 3) 未完成或不确定项。\
             要求：简洁、可执行，不要输出内部推理。"
        );
        let mut summary_messages = messages.to_vec();
        summary_messages.push(ChatMessage::system(summary_prompt));

        match tokio::time::timeout(
            SUMMARY_TIMEOUT,
            self.router.chat_with_failover(&summary_messages, &[]),
        )
        .await
        {
            Ok(response) if response.finish_reason != "error" => {
                match response.content.map(|c| c.trim().to_string()) {
                    Some(content) if !content.is_empty() => content,
                    _ => fallback,
                }
            }
            _ => fallback,
        }
    }

    /// Context-sensitive parameter guard: if the model injected a location
    /// style value the user never mentioned (and inference was not granted),
    /// ask for confirmation instead of calling the tool.
    fn clarification_needed(
        &self,
        messages: &[ChatMessage],
        tool_calls: &[ToolCallRequest],
    ) -> Option<String> {
        let user_text = latest_user_text(messages)?;
        if INFERENCE_HINTS.iter().any(|h| user_text.contains(h)) {
            return None;
        }
        if !CONTEXT_SENSITIVE_KEYWORDS
            .iter()
            .any(|k| user_text.contains(k))
        {
            return None;
        }

        for tc in tool_calls {
            for (key, label) in SENSITIVE_LABELS {
                let Some(candidate) = tc
                    .arguments
                    .get(*key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                else {
                    continue;
                };
                if !self.value_mentioned(&user_text, candidate) {
                    return Some(format!(
                        "在继续之前需要你确认：本次{label}是“{candidate}”吗？如果不是，请告诉我正确的{label}。"
                    ));
                }
            }
        }
        None
    }

    fn value_mentioned(&self, user_text: &str, candidate: &str) -> bool {
        if user_text.contains(candidate) {
            return true;
        }
        // Token overlap fallback for mixed Chinese/English values.
        let tokens = |s: &str| -> HashSet<String> {
            self.token_re
                .find_iter(&s.to_lowercase())
                .map(|m| m.as_str().to_string())
                .collect()
        };
        let cand_tokens = tokens(candidate);
        if cand_tokens.is_empty() {
            return false;
        }
        !tokens(user_text).is_disjoint(&cand_tokens)
    }

    fn format_tool_result(&self, result: &ToolResult, include_severity: bool) -> String {
        let mut output = result.output.clone();
        if let Some(remedy) = &result.remedy {
            output = format!("{output}\n\n[系统及工具建议: {remedy}]");
        }
        if include_severity
            && matches!(
                result.severity,
                ToolSeverity::Warn | ToolSeverity::Error | ToolSeverity::Fatal
            )
        {
            output = format!("[severity:{}]\n{output}", result.severity);
        }
        if result.should_retry {
            output = format!("{output}\n\n[系统提示: 建议重试该工具调用，或调整参数后重试。]");
        }
        if result.requires_user_confirmation {
            output = format!("{output}\n\n[系统提示: 该操作需要用户确认后再执行。]");
        }
        truncate_output(output)
    }

    async fn execute_tool_calls(
        &self,
        messages: &mut Vec<ChatMessage>,
        tool_calls: &[ToolCallRequest],
        trace_id: Option<&str>,
        flags: TurnFlags,
    ) -> Vec<(String, bool)> {
        let mut statuses = Vec::with_capacity(tool_calls.len());

        if flags.parallel_tool_exec {
            let started = Instant::now();
            let futures: Vec<_> = tool_calls
                .iter()
                .map(|tc| {
                    self.log_tool_start(trace_id, tc);
                    self.executor.execute(&tc.name, tc.arguments.clone())
                })
                .collect();
            let results = futures_util::future::join_all(futures).await;
            for (tc, result) in tool_calls.iter().zip(results) {
                let result_str = self.format_tool_result(&result, flags.include_severity);
                statuses.push((tc.name.clone(), result.success));
                self.log_tool_end(trace_id, tc, &result, &result_str, started.elapsed());
                add_tool_result(messages, &tc.id, &tc.name, &result_str);
            }
            return statuses;
        }

        for tc in tool_calls {
            self.log_tool_start(trace_id, tc);
            let started = Instant::now();
            let result = self.executor.execute(&tc.name, tc.arguments.clone()).await;
            let result_str = self.format_tool_result(&result, flags.include_severity);
            statuses.push((tc.name.clone(), result.success));
            self.log_tool_end(trace_id, tc, &result, &result_str, started.elapsed());
            add_tool_result(messages, &tc.id, &tc.name, &result_str);
        }
        statuses
    }

    fn log_tool_start(&self, trace_id: Option<&str>, tc: &ToolCallRequest) {
        debug!(trace_id = ?trace_id, tool = %tc.name, "executing tool");
        let args_keys: Vec<String> = tc
            .arguments
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        self.audit.log_event(serde_json::json!({
            "type": "tool_start",
            "trace_id": trace_id,
            "tool": tc.name,
            "tool_call_id": tc.id,
            "args_keys": args_keys,
        }));
    }

    fn log_tool_end(
        &self,
        trace_id: Option<&str>,
        tc: &ToolCallRequest,
        result: &ToolResult,
        result_str: &str,
        elapsed: Duration,
    ) {
        let status = classify_tool_status(result, result_str);
        self.audit.log_event(serde_json::json!({
            "type": "tool_end",
            "trace_id": trace_id,
            "tool": tc.name,
            "tool_call_id": tc.id,
            "status": status,
            "duration_s": (elapsed.as_secs_f64() * 10_000.0).round() / 10_000.0,
            "result_len": result_str.chars().count(),
        }));
    }

    /// Compact the live message list when context utilization crosses the
    /// threshold: keep system messages (deduplicating stale summaries), the
    /// LLM summary of the middle window, and the most recent messages.
    async fn compact_messages_if_needed(
        &self,
        messages: &mut Vec<ChatMessage>,
        trace_id: Option<&str>,
    ) {
        let guard = ContextGuard::for_model(&self.model);
        let evaluation = guard.evaluate(messages);
        if !evaluation.should_compact {
            return;
        }
        info!(
            trace_id = ?trace_id,
            utilization = format!("{:.2}", evaluation.utilization),
            "context utilization high, triggering compaction"
        );

        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        if non_system <= KEEP_RECENT {
            return;
        }
        let prefix: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let middle: Vec<ChatMessage> =
            messages[prefix.len()..messages.len() - KEEP_RECENT].to_vec();
        let recent: Vec<ChatMessage> = messages[messages.len() - KEEP_RECENT..].to_vec();

        let Some(summary) = self.summarize_messages(&middle).await else {
            return;
        };

        let mut rebuilt: Vec<ChatMessage> = prefix
            .into_iter()
            .filter(|m| {
                !m.text()
                    .map(|t| t.contains("Previous conversation summary:"))
                    .unwrap_or(false)
            })
            .collect();
        rebuilt.push(ChatMessage::system(format!(
            "Previous conversation summary: {summary}"
        )));
        rebuilt.extend(recent);
        *messages = rebuilt;
        info!(trace_id = ?trace_id, "context compacted via LLM summary");
    }
}

fn latest_user_text(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.text())
        .map(str::to_string)
        .filter(|t| !t.is_empty())
}

fn is_empty_like(content: Option<&str>) -> bool {
    match content {
        None => true,
        Some(text) => {
            let trimmed = text.trim();
            trimmed.is_empty() || trimmed == "[正在处理中...]" || trimmed == "正在处理中..."
        }
    }
}

fn classify_tool_status(result: &ToolResult, result_text: &str) -> &'static str {
    if result.success {
        return "ok";
    }
    let lower = result_text.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("超时") {
        "timeout"
    } else {
        "error"
    }
}

fn truncate_output(output: String) -> String {
    let total = output.chars().count();
    if total <= MAX_TOOL_RESULT_CHARS {
        return output;
    }
    let kept: String = output.chars().take(MAX_TOOL_RESULT_CHARS).collect();
    format!(
        "{kept}... (truncated, {} more chars)",
        total - MAX_TOOL_RESULT_CHARS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_like_detection() {
        assert!(is_empty_like(None));
        assert!(is_empty_like(Some("   ")));
        assert!(is_empty_like(Some("[正在处理中...]")));
        assert!(!is_empty_like(Some("完成")));
    }

    #[test]
    fn truncation_reports_remaining_chars() {
        let long = "x".repeat(MAX_TOOL_RESULT_CHARS + 42);
        let truncated = truncate_output(long);
        assert!(truncated.ends_with("... (truncated, 42 more chars)"));

        let short = truncate_output("fine".to_string());
        assert_eq!(short, "fine");
    }

    #[test]
    fn tool_status_classification() {
        let ok = ToolResult::ok("done");
        assert_eq!(classify_tool_status(&ok, "done"), "ok");
        let failed = ToolResult::fail("boom");
        assert_eq!(classify_tool_status(&failed, "boom"), "error");
        assert_eq!(
            classify_tool_status(&failed, "operation timed out after 30s"),
            "timeout"
        );
    }

    #[test]
    fn bounded_trace_map_evicts_oldest() {
        let mut map: BoundedTraceMap<usize> = BoundedTraceMap::new();
        for i in 0..(TRACE_CACHE_CAP + 5) {
            map.insert(format!("trace-{i}"), i);
        }
        assert!(map.pop("trace-0").is_none());
        assert_eq!(map.pop(&format!("trace-{}", TRACE_CACHE_CAP + 4)), Some(TRACE_CACHE_CAP + 4));
    }
}
