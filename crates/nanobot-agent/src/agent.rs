//! The agent loop: wires bus, command queue, sessions, tools, providers, the
//! turn engine, and both turn services; owns the inbound dispatcher, the
//! heartbeat, and the direct-processing entrypoint used by the CLI and cron.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};

use nanobot_bus::MessageBus;
use nanobot_core::config::NanobotConfig;
use nanobot_core::types::{InboundMessage, OutboundMessage};
use nanobot_core::{AuditLog, FailureStore};
use nanobot_cron::{CronService, OnJob};
use nanobot_hooks::HookRegistry;
use nanobot_memory::MemoryStore;
use nanobot_process::{CommandLane, CommandQueue};
use nanobot_providers::{LlmProvider, ModelRegistry, OpenAiCompatProvider, ProviderRouter};
use nanobot_sessions::SessionStore;

use crate::context::ContextBuilder;
use crate::executor::ToolExecutor;
use crate::incident::IncidentManager;
use crate::message_flow::MessageFlowCoordinator;
use crate::policy::ToolPolicy;
use crate::session_commands::SessionCommands;
use crate::system_turn::SystemTurnService;
use crate::tools::cron_tool::CronTool;
use crate::tools::memory_tool::MemoryTool;
use crate::tools::message::MessageTool;
use crate::tools::ToolRegistry;
use crate::turn_engine::{TurnEngine, TurnLimits};
use crate::user_turn::UserTurnService;

const SELF_CORRECTION_PROMPT: &str = "系统检测到你正在重复执行相同的工具调用且未取得进展。可能原因是之前的工具输出未满足预期。请不要再次尝试相同操作，改用其他思路（例如检查文件是否存在、调整搜索词、或向用户确认需求）。";

const LOOP_BREAK_REPLY: &str =
    "抱歉，我陷入了重复执行的循环并未能恢复。请检查当前指令是否超出权限，或提供更明确的需求。";

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    queue: CommandQueue,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ToolRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub incidents: Arc<IncidentManager>,
    pub model_registry: Arc<ModelRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub engine: Arc<TurnEngine>,
    user_turn: UserTurnService,
    system_turn: SystemTurnService,
    flow: MessageFlowCoordinator,
    session_commands: SessionCommands,
    message_tool: Arc<MessageTool>,
}

impl AgentLoop {
    pub fn new(
        config: &NanobotConfig,
        workspace: &Path,
        bus: Arc<MessageBus>,
        cron: Arc<CronService>,
        audit: AuditLog,
        failures: FailureStore,
    ) -> Arc<Self> {
        let queue = CommandQueue::new();
        let hooks = Arc::new(HookRegistry::new());
        let incidents = Arc::new(IncidentManager::with_defaults(failures));
        let registry = Arc::new(ToolRegistry::new());
        let executor = Arc::new(ToolExecutor::new(
            registry.clone(),
            hooks.clone(),
            Some(incidents.clone()),
        ));

        let model_registry = Arc::new(ModelRegistry::new());
        for entry in &config.brain.provider_registry {
            model_registry.register(
                &entry.name,
                &entry.base_url,
                &entry.api_key,
                entry.default_model.as_deref(),
                entry.is_free,
            );
        }

        let primary = build_primary_provider(config);
        let router = Arc::new(ProviderRouter::new(
            primary,
            &config.brain.model,
            model_registry.clone(),
            config.brain.max_tokens,
            config.brain.temperature,
        ));

        let memory = Arc::new(MemoryStore::new(workspace));
        let context = Arc::new(ContextBuilder::new(
            workspace,
            &config.brain.model,
            config.brain.clone(),
            memory.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(nanobot_core::paths::sessions_dir()));

        let policy = ToolPolicy::new(
            &config.tools.policy.web_default,
            config.tools.policy.enable_mcp_fallback,
            config.tools.policy.allow_explicit_mcp,
        );
        let engine = Arc::new(TurnEngine::new(
            router.clone(),
            executor.clone(),
            registry.clone(),
            policy,
            hooks.clone(),
            audit,
            &config.brain.model,
            TurnLimits {
                max_iterations: config.brain.max_iterations.max(1),
                max_total_tool_calls: config.brain.max_total_tool_calls.max(1),
                max_turn_seconds: config.brain.max_turn_seconds.max(5),
            },
            SELF_CORRECTION_PROMPT,
            LOOP_BREAK_REPLY,
        ));

        let user_turn = UserTurnService::new(
            sessions.clone(),
            context.clone(),
            registry.clone(),
            executor.clone(),
            engine.clone(),
            config.brain.clone(),
        );
        let system_turn = SystemTurnService::new(
            sessions.clone(),
            context,
            registry.clone(),
            executor.clone(),
            engine.clone(),
            &config.tools.error_fallback_channel,
        );
        let flow = MessageFlowCoordinator::new(
            config.tools.busy_notice_threshold,
            config.tools.busy_notice_debounce_seconds,
            &config.tools.error_fallback_channel,
            &config.tools.error_fallback_chat_id,
            bus.clone(),
        );

        // Default tool set. Everything else registers from the outside.
        let message_tool = Arc::new(MessageTool::new(bus.clone()));
        registry.register(message_tool.clone());
        registry.register(Arc::new(CronTool::new(cron)));
        registry.register(Arc::new(MemoryTool::new(memory)));

        let session_commands = SessionCommands::new(sessions.clone());

        let agent = Arc::new(Self {
            bus: bus.clone(),
            queue,
            sessions,
            registry,
            hooks,
            incidents: incidents.clone(),
            model_registry,
            executor,
            engine,
            user_turn,
            system_turn,
            flow,
            session_commands,
            message_tool: message_tool.clone(),
        });

        // Router pulses go to wherever the active turn is talking.
        {
            let bus = bus.clone();
            let message_tool = message_tool.clone();
            router.set_pulse(Arc::new(move |text| {
                let bus = bus.clone();
                let target = message_tool.current_target();
                Box::pin(async move {
                    if let Some((channel, chat_id)) = target {
                        bus.publish_outbound(
                            OutboundMessage::new(channel, chat_id, text),
                            Duration::from_secs(5),
                        )
                        .await;
                    }
                })
            }));
        }

        // Escalated incidents notify the origin chat (or the fallback).
        {
            let bus = bus.clone();
            let fallback_channel = config.tools.error_fallback_channel.clone();
            let fallback_chat_id = config.tools.error_fallback_chat_id.clone();
            incidents.set_on_decision(Arc::new(move |event, decision| {
                if !decision.should_notify_user {
                    return;
                }
                let channel = event
                    .details
                    .get("channel")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&fallback_channel)
                    .to_string();
                let chat_id = event
                    .details
                    .get("chat_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&fallback_chat_id)
                    .to_string();
                let content = format!(
                    "⚠️ 检测到持续性故障（{}，窗口内第 {} 次）：{}",
                    event.category, decision.count_in_window, event.summary
                );
                let bus = bus.clone();
                tokio::spawn(async move {
                    bus.publish_outbound(
                        OutboundMessage::new(channel, chat_id, content),
                        Duration::from_secs(5),
                    )
                    .await;
                });
            }));
        }

        agent
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Consume the inbound bus until shutdown. Each message is dispatched to
    /// its lane; processing never blocks this loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("agent loop started");
        loop {
            tokio::select! {
                maybe = self.bus.consume_inbound() => {
                    match maybe {
                        Some(msg) => {
                            let agent = Arc::clone(&self);
                            tokio::spawn(async move { agent.handle_inbound(msg).await });
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("agent loop stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, msg: InboundMessage) {
        let lane = self.flow.lane_for(&msg);
        self.flow.maybe_send_busy_notice(&msg, lane, &self.queue).await;

        let agent = Arc::clone(&self);
        let enqueue_result = self
            .queue
            .enqueue(lane, async move {
                let response = agent.process_inner(&msg).await;
                match response {
                    Ok(Some(out)) => {
                        agent
                            .bus
                            .publish_outbound(out, Duration::from_secs(10))
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "error processing message in queue");
                        agent
                            .bus
                            .publish_outbound(
                                agent.flow.build_error_outbound(&msg, &e),
                                Duration::from_secs(10),
                            )
                            .await;
                    }
                }
            })
            .await;
        if enqueue_result.is_err() {
            error!("queued task was cancelled before completion");
        }
    }

    /// Process one message to an optional reply. Panics in the turn stack are
    /// converted to an error string so the dispatcher can apologise to the
    /// origin instead of dying.
    async fn process_inner(
        &self,
        msg: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, String> {
        use futures_util::FutureExt;

        if msg.channel != "system" {
            // Session control commands never reach the model.
            if let Some(reply) = self.session_commands.try_handle(msg) {
                return Ok(Some(reply));
            }
        }

        let fut = async {
            if msg.channel == "system" {
                self.system_turn.process(msg).await
            } else {
                // Route the turn to the channel's active (possibly rotated)
                // session unless the caller pinned a key.
                let mut routed = msg.clone();
                if routed.session_key_override.is_none() {
                    routed.session_key_override = Some(
                        self.session_commands
                            .active_session_key(&routed.channel, &routed.chat_id),
                    );
                }
                self.user_turn.process(&routed).await
            }
        };
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(response) => Ok(response),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "internal error".to_string());
                Err(detail)
            }
        }
    }

    /// Direct processing for the CLI and cron. Queued on `lane` like any
    /// other request; returns the reply content without publishing it.
    pub async fn process_direct(
        self: &Arc<Self>,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        lane: CommandLane,
    ) -> String {
        let mut msg = InboundMessage::new(channel, "user", chat_id, content);
        msg.session_key_override = Some(session_key.to_string());
        msg.trace_id = Some(uuid::Uuid::new_v4().to_string());

        let agent = Arc::clone(self);
        self.queue
            .enqueue(lane, async move {
                match agent.process_inner(&msg).await {
                    Ok(Some(out)) => out.content,
                    Ok(None) => String::new(),
                    Err(e) => format!("抱歉，我在处理指令时遇到了错误: {e}"),
                }
            })
            .await
            .unwrap_or_default()
    }

    /// The cron service's fired-job callback: route the job through the
    /// background lane as a system message carrying its origin envelope.
    pub fn cron_callback(self: &Arc<Self>) -> OnJob {
        let agent = Arc::clone(self);
        Arc::new(move |job| {
            let agent = Arc::clone(&agent);
            Box::pin(async move {
                let mut msg =
                    InboundMessage::new("system", "cron", "direct", job.payload.message.clone());
                msg.trace_id = Some(format!("cron-{}", job.id));
                msg.session_key_override = Some(format!("cron:{}", job.id));
                if let (Some(channel), Some(to)) = (&job.payload.channel, &job.payload.to) {
                    msg.metadata.insert(
                        "origin".to_string(),
                        json!({"channel": channel, "chat_id": to}),
                    );
                }
                let deliver = job.payload.deliver;

                let inner = Arc::clone(&agent);
                let queued = agent
                    .queue
                    .enqueue(CommandLane::Background, async move {
                        inner.process_inner(&msg).await
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                let outcome = queued?;

                match outcome {
                    Some(out) if deliver => {
                        agent
                            .bus
                            .publish_outbound(out, Duration::from_secs(10))
                            .await;
                        Ok("delivered".to_string())
                    }
                    Some(_) => Ok("completed (delivery suppressed)".to_string()),
                    None => Ok("completed (silent)".to_string()),
                }
            })
        })
    }

    /// Periodic heartbeat: when `<workspace>/HEARTBEAT.md` has content, run
    /// it as a background instruction. Always leaves an audit trail.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        workspace: std::path::PathBuf,
        interval: Duration,
        audit: AuditLog,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let prompt = std::fs::read_to_string(workspace.join("HEARTBEAT.md"))
                        .unwrap_or_default();
                    if prompt.trim().is_empty() {
                        continue;
                    }
                    audit.log_event(json!({"type": "heartbeat_start"}));
                    let reply = self
                        .process_direct(&prompt, "heartbeat", "system", "heartbeat", CommandLane::Background)
                        .await;
                    if reply.contains("遇到了错误") {
                        audit.log_event(json!({"type": "heartbeat_error", "detail": reply}));
                    } else {
                        audit.log_event(json!({"type": "heartbeat_complete", "reply_len": reply.chars().count()}));
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Where the active turn is delivering (used by external pulse senders).
    pub fn current_target(&self) -> Option<(String, String)> {
        self.message_tool.current_target()
    }
}

/// Primary provider from config, first match wins. With nothing configured
/// the router still works; every call fails over and ultimately yields the
/// synthetic "all brains down" reply.
fn build_primary_provider(config: &NanobotConfig) -> Arc<dyn LlmProvider> {
    let model = &config.brain.model;
    let candidates = [
        (&config.providers.openai, "openai", "https://api.openai.com/v1"),
        (&config.providers.deepseek, "deepseek", "https://api.deepseek.com/v1"),
        (&config.providers.openrouter, "openrouter", "https://openrouter.ai/api/v1"),
        (
            &config.providers.gemini,
            "gemini",
            "https://generativelanguage.googleapis.com/v1beta/openai",
        ),
        (&config.providers.anthropic, "anthropic", "https://api.anthropic.com/v1"),
    ];
    for (credential, name, default_base) in candidates {
        if let Some(cred) = credential {
            let base = cred.api_base.as_deref().unwrap_or(default_base);
            return Arc::new(OpenAiCompatProvider::new(name, base, &cred.api_key, model));
        }
    }
    Arc::new(OpenAiCompatProvider::new(
        "primary",
        "https://api.openai.com/v1",
        "",
        model,
    ))
}
