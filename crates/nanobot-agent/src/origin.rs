//! Resolve where system-triggered output should be delivered.

use serde_json::Value;

use nanobot_core::types::InboundMessage;

/// Delivery target and session for a system-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemOrigin {
    pub channel: String,
    pub chat_id: String,
}

impl SystemOrigin {
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Priority: `metadata.origin.{channel,chat_id}`, then a `channel:chat_id`
/// encoded chat id, finally the default channel with the raw chat id.
pub fn resolve_system_origin(msg: &InboundMessage, default_channel: &str) -> SystemOrigin {
    if let Some(origin) = msg.metadata.get("origin").and_then(Value::as_object) {
        let channel = origin.get("channel").and_then(Value::as_str);
        let chat_id = origin.get("chat_id").and_then(Value::as_str);
        if let (Some(channel), Some(chat_id)) = (channel, chat_id) {
            if !channel.is_empty() && !chat_id.is_empty() {
                return SystemOrigin {
                    channel: channel.to_string(),
                    chat_id: chat_id.to_string(),
                };
            }
        }
    }

    if let Some((channel, chat_id)) = msg.chat_id.split_once(':') {
        return SystemOrigin {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
        };
    }

    SystemOrigin {
        channel: default_channel.to_string(),
        chat_id: msg.chat_id.clone(),
    }
}
