//! The `message` tool: deliver a message to the current chat mid-turn.
//! Also the source of truth for "where is this turn talking to", which the
//! router's pulse sender reads.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use nanobot_bus::MessageBus;
use nanobot_core::types::OutboundMessage;

use super::{DeliveryContext, Tool, ToolResult};

pub struct MessageTool {
    bus: Arc<MessageBus>,
    context: Mutex<Option<(String, String)>>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            context: Mutex::new(None),
        }
    }

    /// The `(channel, chat_id)` this turn delivers to, if a turn is active.
    pub fn current_target(&self) -> Option<(String, String)> {
        self.context.lock().expect("message context poisoned").clone()
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "发送一条消息给当前会话的用户。用于长任务的中途进度汇报。"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "Message text to send"}
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let content = params["content"].as_str().unwrap_or_default();
        if content.is_empty() {
            return ToolResult::fail("Error: content is required");
        }
        let Some((channel, chat_id)) = self.current_target() else {
            return ToolResult::fail("Error: no session context (channel/chat_id)");
        };
        let delivered = self
            .bus
            .publish_outbound(
                OutboundMessage::new(channel, chat_id, content),
                Duration::from_secs(10),
            )
            .await;
        if delivered {
            ToolResult::ok("Message sent.")
        } else {
            ToolResult::fail("Error: outbound queue full, message dropped")
                .with_remedy("稍后重试，或减少中途消息的发送频率。")
        }
    }

    fn set_context(&self, ctx: &DeliveryContext) {
        *self.context.lock().expect("message context poisoned") =
            Some((ctx.channel.clone(), ctx.chat_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_to_current_context() {
        let bus = Arc::new(MessageBus::new(4));
        let tool = MessageTool::new(bus.clone());
        tool.set_context(&DeliveryContext {
            channel: "telegram".into(),
            chat_id: "42".into(),
            session_key: "telegram:42".into(),
            trace_id: None,
        });

        let result = tool.execute(json!({"content": "进度 50%"})).await;
        assert!(result.success);
        assert_eq!(bus.outbound_size(), 1);
    }

    #[tokio::test]
    async fn refuses_without_context() {
        let bus = Arc::new(MessageBus::new(4));
        let tool = MessageTool::new(bus);
        let result = tool.execute(json!({"content": "hi"})).await;
        assert!(!result.success);
        assert!(result.output.contains("no session context"));
    }
}
