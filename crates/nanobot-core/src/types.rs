use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sentinel the model may emit to suppress the outbound reply for a turn.
/// The turn is still persisted to the session.
pub const SILENT_REPLY_TOKEN: &str = "SILENT_REPLY_TOKEN";

/// A message received from a chat channel, immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Logical channel name (e.g. "telegram", "discord", "system", "cli").
    pub channel: String,

    /// Platform-native identifier for the sender.
    pub sender_id: String,

    /// Platform-native identifier for the conversation.
    pub chat_id: String,

    /// Plain text content.
    pub content: String,

    /// Local file paths for attached media, in receive order.
    #[serde(default)]
    pub media: Vec<PathBuf>,

    /// Free-form metadata. May carry an `origin` envelope
    /// (`{"channel": ..., "chat_id": ...}`) for system-channel messages.
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Opaque correlation id propagated through audit events.
    #[serde(default)]
    pub trace_id: Option<String>,

    /// Overrides the derived session key when set (e.g. `cron:<job_id>`).
    #[serde(default)]
    pub session_key_override: Option<String>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: Map::new(),
            trace_id: None,
            session_key_override: None,
        }
    }

    /// Effective session key: the override if set, else `"{channel}:{chat_id}"`.
    pub fn session_key(&self) -> String {
        self.session_key_override
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.channel, self.chat_id))
    }
}

/// A response to be delivered back to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            trace_id: None,
        }
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain text, or a list of provider-shaped content parts
/// (text + image_url) when media is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    /// Borrow the text when the content is plain text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            MessageContent::Parts(_) => None,
        }
    }

    /// Render to a plain string, JSON-encoding structured parts.
    pub fn to_text_lossy(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => {
                serde_json::to_string(parts).unwrap_or_default()
            }
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// One message in a session or a live prompt.
///
/// Tool messages must follow an assistant message that declared the matching
/// `tool_call_id`; the assistant message carries the raw provider-shaped
/// `tool_calls` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A `role:"tool"` result message bound to a prior tool call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<MessageContent>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        msg
    }

    pub fn with_timestamp(mut self, ts: impl Into<String>) -> Self {
        self.timestamp = Some(ts.into());
        self
    }

    /// Plain text content, if this message has any.
    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }
}
