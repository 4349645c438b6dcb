//! The system turn service: origin-aware processing of `system`-channel
//! messages (cron fire-backs, subagent results) with the conservative turn
//! flags.

use std::sync::Arc;

use tracing::info;

use nanobot_core::types::{InboundMessage, OutboundMessage, Role};
use nanobot_sessions::SessionStore;

use crate::context::ContextBuilder;
use crate::executor::{RuntimeContext, ToolExecutor};
use crate::honesty::audit_and_mark_hallucinations;
use crate::origin::resolve_system_origin;
use crate::reply::{filter_reasoning, is_silent_reply};
use crate::tools::{DeliveryContext, ToolRegistry};
use crate::turn_engine::{TurnEngine, TurnFlags};

pub struct SystemTurnService {
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    registry: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    engine: Arc<TurnEngine>,
    default_channel: String,
}

impl SystemTurnService {
    pub fn new(
        sessions: Arc<SessionStore>,
        context: Arc<ContextBuilder>,
        registry: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        engine: Arc<TurnEngine>,
        default_channel: &str,
    ) -> Self {
        Self {
            sessions,
            context,
            registry,
            executor,
            engine,
            default_channel: default_channel.to_string(),
        }
    }

    pub async fn process(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        info!(sender = %msg.sender_id, "processing system message");
        let origin = resolve_system_origin(msg, &self.default_channel);
        let session_key = origin.session_key();

        let mut session = self.sessions.get_or_create(&session_key);

        self.registry.set_delivery_context(&DeliveryContext {
            channel: origin.channel.clone(),
            chat_id: origin.chat_id.clone(),
            session_key: session_key.clone(),
            trace_id: msg.trace_id.clone(),
        });
        self.executor.set_runtime_context(RuntimeContext {
            channel: Some(origin.channel.clone()),
            chat_id: Some(origin.chat_id.clone()),
            trace_id: msg.trace_id.clone(),
            session_key: Some(session_key.clone()),
        });

        let mut messages = self
            .context
            .build_messages(session.history(), &msg.content, None);

        let final_content = self
            .engine
            .run(&mut messages, msg.trace_id.as_deref(), TurnFlags::system_turn())
            .await
            .unwrap_or_else(|| "Background task completed.".to_string());

        let final_content = filter_reasoning(&final_content);
        let used_tools = self.engine.pop_used_tools(msg.trace_id.as_deref());
        let _ = self.engine.pop_execution_report(msg.trace_id.as_deref());

        let metas = self.registry.metadata();
        let (final_content, hallucination_detected) =
            audit_and_mark_hallucinations(&final_content, &used_tools, &metas);

        session.add_message(
            Role::User,
            format!("[System: {}] {}", msg.sender_id, msg.content),
        );
        if hallucination_detected {
            session.add_message(
                Role::System,
                "[诚信审计] 警告：你的上一条后台指令回复中包含了未实际执行的工具动作声明。请诚实汇报进度！",
            );
        }

        self.executor.clear_runtime_context();

        if is_silent_reply(&final_content) {
            let _ = self.sessions.save(&mut session);
            return None;
        }

        session.add_message(Role::Assistant, final_content.clone());
        let _ = self.sessions.save(&mut session);

        Some(OutboundMessage::new(
            origin.channel,
            origin.chat_id,
            final_content,
        ))
    }
}
