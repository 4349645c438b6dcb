//! The user turn service: session lifecycle, the full-featured turn run, and
//! the honesty pipeline (audit, execution truth, source header) for
//! user-visible replies.

use std::sync::Arc;

use regex::Regex;
use tracing::info;

use nanobot_core::config::BrainConfig;
use nanobot_core::types::{InboundMessage, OutboundMessage, Role};
use nanobot_sessions::{Session, SessionStore};

use crate::context::ContextBuilder;
use crate::context_guard::{ContextGuard, TokenCounter};
use crate::executor::{RuntimeContext, ToolExecutor};
use crate::honesty::audit_and_mark_hallucinations;
use crate::reply::{filter_reasoning, is_silent_reply};
use crate::tools::{DeliveryContext, ToolRegistry};
use crate::turn_engine::{ExecutionReport, TurnEngine, TurnFlags};

/// Maps tools to the user-facing source label in the `查询来源:` header.
const SOURCE_MAP: &[(&str, &str)] = &[
    ("train_ticket", "12306"),
    ("github", "GitHub"),
    ("tavily", "Tavily API"),
    ("mcp:amap", "高德地图"),
    ("mcp:12306", "12306"),
    ("mcp:github", "GitHub"),
    ("mcp:puppeteer", "Browser"),
    ("browser", "Browser"),
    ("weather", "和风天气 API"),
    ("tianapi", "天行 API"),
    ("tushare", "Tushare API"),
];

pub struct UserTurnService {
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    registry: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    engine: Arc<TurnEngine>,
    brain: BrainConfig,
    source_header: Regex,
    strategy_header: Regex,
    completion_claim: Regex,
}

impl UserTurnService {
    pub fn new(
        sessions: Arc<SessionStore>,
        context: Arc<ContextBuilder>,
        registry: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        engine: Arc<TurnEngine>,
        brain: BrainConfig,
    ) -> Self {
        Self {
            sessions,
            context,
            registry,
            executor,
            engine,
            brain,
            source_header: Regex::new(r"^\s*查询来源\s*:").expect("static regex"),
            strategy_header: Regex::new(r"^\s*联网策略\s*:").expect("static regex"),
            completion_claim: Regex::new(r"已完成|已经完成|处理完成|执行完成|已处理完")
                .expect("static regex"),
        }
    }

    pub async fn process(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        info!(
            trace_id = ?msg.trace_id,
            channel = %msg.channel,
            sender = %msg.sender_id,
            "processing user message"
        );

        let session_key = msg.session_key();
        let mut session = self.sessions.get_or_create(&session_key);
        self.compact_history(&mut session).await;

        self.registry.set_delivery_context(&DeliveryContext {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            session_key: session_key.clone(),
            trace_id: msg.trace_id.clone(),
        });
        self.executor.set_runtime_context(RuntimeContext {
            channel: Some(msg.channel.clone()),
            chat_id: Some(msg.chat_id.clone()),
            trace_id: msg.trace_id.clone(),
            session_key: Some(session_key.clone()),
        });

        let media = (!msg.media.is_empty()).then_some(msg.media.as_slice());
        let mut messages = self
            .context
            .build_messages(session.history(), &msg.content, media);

        let final_content = self
            .engine
            .run(&mut messages, msg.trace_id.as_deref(), TurnFlags::user_turn())
            .await
            .unwrap_or_else(|| "我已经完成了处理，但暂时没有需要回复的具体内容。".to_string());

        let mut final_content = filter_reasoning(&final_content);
        let used_tools = self.engine.pop_used_tools(msg.trace_id.as_deref());
        let report = self.engine.pop_execution_report(msg.trace_id.as_deref());

        let metas = self.registry.metadata();
        let (audited, hallucination_detected) =
            audit_and_mark_hallucinations(&final_content, &used_tools, &metas);
        final_content = audited;

        final_content = self.enforce_execution_truth(&final_content, report);
        final_content = self.add_query_source_line(&final_content, &used_tools);

        if final_content.trim().is_empty() {
            final_content =
                "本次未产出有效结果，可能模型或工具链暂时不可用。请重试一次。".to_string();
        }

        session.add_message(Role::User, msg.content.clone());

        if hallucination_detected {
            // Keep the correction in-session so later turns don't build on
            // hallucinated facts.
            session.add_message(
                Role::System,
                "[诚信审计] 警告：你的上一条回复中包含了未实际执行的工具动作声明，已被内核物理拦截说明或标记为删除线。请根据 Tool 执行记录诚实汇报！",
            );
        }

        self.executor.clear_runtime_context();

        if is_silent_reply(&final_content) {
            let _ = self.sessions.save(&mut session);
            return None;
        }

        session.add_message(Role::Assistant, final_content.clone());
        let _ = self.sessions.save(&mut session);

        let mut outbound = OutboundMessage::new(&msg.channel, &msg.chat_id, final_content);
        outbound.trace_id = msg.trace_id.clone();
        Some(outbound)
    }

    /// Proactive history compaction: summarize everything but the last 10
    /// messages once the session nears 60% of the context limit or the
    /// configured message count.
    async fn compact_history(&self, session: &mut Session) {
        if !self.brain.auto_summarize {
            return;
        }
        let guard = ContextGuard::for_model(self.context.model());
        let safe_limit = guard.limit() as f64 * 0.6;
        let usage = TokenCounter::count_messages(&session.messages) as f64;
        if usage < safe_limit && session.messages.len() < self.brain.summary_threshold {
            return;
        }
        if session.messages.len() <= 10 {
            return;
        }

        info!(
            key = %session.key,
            usage = usage as usize,
            messages = session.messages.len(),
            "auto-compacting session history"
        );
        let split = session.messages.len() - 10;
        let Some(summary) = self.engine.summarize_messages(&session.messages[..split]).await
        else {
            return;
        };
        let mut rebuilt = vec![];
        let mut summary_msg =
            nanobot_core::types::ChatMessage::system(format!("以下是更早对话的摘要：{summary}"));
        summary_msg.timestamp = Some(chrono::Utc::now().to_rfc3339());
        rebuilt.push(summary_msg);
        rebuilt.extend_from_slice(&session.messages[split..]);
        session.messages = rebuilt;
        let _ = self.sessions.save(session);
    }

    /// Never let the model sound successful when the execution record says
    /// otherwise.
    fn enforce_execution_truth(&self, content: &str, report: ExecutionReport) -> String {
        if report.total == 0 {
            return content.to_string();
        }
        let text = content.trim();

        if report.success == 0 {
            return format!(
                "本次尝试调用了 {} 次工具，但均未成功执行，当前无法确认任务已完成。\n\
                 请允许我调整方案后重试，或你提供更明确的参数/权限范围。",
                report.total
            );
        }

        if self.completion_claim.is_match(text) && report.failed > 0 {
            return format!(
                "{text}\n\n执行说明：本轮工具调用共 {} 次，成功 {} 次，失败 {} 次。",
                report.total, report.success, report.failed
            );
        }
        text.to_string()
    }

    /// Source headers are system-owned: drop anything model-generated, then
    /// re-derive the canonical `查询来源:` line from the real used tools.
    fn add_query_source_line(&self, content: &str, used_tools: &[String]) -> String {
        let body = self.strip_source_headers(content);
        if used_tools.is_empty() {
            return body;
        }
        let mut sources: Vec<&str> = Vec::new();
        for tool in used_tools {
            let Some((_, label)) = SOURCE_MAP.iter().find(|(name, _)| name == tool) else {
                continue;
            };
            if !sources.contains(label) {
                sources.push(label);
            }
        }
        if sources.is_empty() {
            return body;
        }
        format!("查询来源: {}\n\n{}", sources.join(" + "), body)
    }

    fn strip_source_headers(&self, content: &str) -> String {
        content
            .lines()
            .filter(|line| {
                !self.source_header.is_match(line) && !self.strategy_header.is_match(line)
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &tempfile::TempDir) -> UserTurnService {
        use nanobot_core::AuditLog;
        use nanobot_hooks::HookRegistry;
        use nanobot_memory::MemoryStore;
        use nanobot_providers::{LLMResponse, LlmProvider, ModelRegistry, ProviderRouter};

        struct Mute;
        #[async_trait::async_trait]
        impl LlmProvider for Mute {
            fn name(&self) -> &str {
                "mute"
            }
            fn api_base(&self) -> &str {
                "https://mute.example/v1"
            }
            fn default_model(&self) -> &str {
                "m"
            }
            async fn chat(
                &self,
                _req: &nanobot_providers::ChatRequest,
            ) -> Result<LLMResponse, nanobot_providers::ProviderError> {
                Ok(LLMResponse::text("ok"))
            }
        }

        let registry = Arc::new(ToolRegistry::new());
        let hooks = Arc::new(HookRegistry::new());
        let executor = Arc::new(ToolExecutor::new(registry.clone(), hooks.clone(), None));
        let router = Arc::new(ProviderRouter::new(
            Arc::new(Mute),
            "m",
            Arc::new(ModelRegistry::new()),
            256,
            0.7,
        ));
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let engine = Arc::new(TurnEngine::new(
            router,
            executor.clone(),
            registry.clone(),
            crate::policy::ToolPolicy::default(),
            hooks,
            audit,
            "m",
            crate::turn_engine::TurnLimits {
                max_iterations: 5,
                max_total_tool_calls: 30,
                max_turn_seconds: 45,
            },
            "self-correct",
            "loop-break",
        ));
        let memory = Arc::new(MemoryStore::new(dir.path()));
        let context = Arc::new(ContextBuilder::new(
            dir.path(),
            "m",
            BrainConfig::default(),
            memory,
        ));
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
        UserTurnService::new(
            sessions,
            context,
            registry,
            executor,
            engine,
            BrainConfig::default(),
        )
    }

    #[test]
    fn all_failures_replace_completion_claims() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let out = svc.enforce_execution_truth(
            "任务已完成，一切顺利。",
            ExecutionReport { total: 3, success: 0, failed: 3 },
        );
        assert!(out.contains("本次尝试调用了 3 次工具"));
        assert!(!out.contains("一切顺利"));
    }

    #[test]
    fn partial_failure_appends_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let out = svc.enforce_execution_truth(
            "数据拉取已完成。",
            ExecutionReport { total: 4, success: 3, failed: 1 },
        );
        assert!(out.starts_with("数据拉取已完成。"));
        assert!(out.contains("成功 3 次，失败 1 次"));
    }

    #[test]
    fn source_header_is_system_owned() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let content = "查询来源: 模型瞎编的\n联网策略: 也是编的\n真正的回答。";
        let out = svc.add_query_source_line(content, &["tavily".to_string()]);
        assert!(out.starts_with("查询来源: Tavily API\n\n"));
        assert!(!out.contains("瞎编"));
        assert!(out.contains("真正的回答。"));
    }

    #[test]
    fn no_used_tools_means_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let out = svc.add_query_source_line("回答。", &[]);
        assert_eq!(out, "回答。");
    }
}
