use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use nanobot_core::types::{ChatMessage, MessageContent, Role};

/// An in-memory session: ordered messages plus header metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            metadata: Map::new(),
        }
    }

    /// Append a message, stamping the current time.
    pub fn add_message(&mut self, role: Role, content: impl Into<MessageContent>) {
        self.messages
            .push(ChatMessage::new(role, content).with_timestamp(chrono::Utc::now().to_rfc3339()));
    }

    /// Conversation history as passed to the context builder.
    pub fn history(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// The metadata header written as the first JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionHeader {
    #[serde(rename = "_type")]
    pub kind: String,
    pub key: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionHeader {
    pub fn of(session: &Session) -> Self {
        Self {
            kind: "metadata".to_string(),
            key: session.key.clone(),
            created_at: session.created_at.clone(),
            updated_at: session.updated_at.clone(),
            metadata: session.metadata.clone(),
        }
    }
}
