use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nanobot_core::types::ChatMessage;

/// A tool call extracted from a model response (or parsed from its text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Always a JSON object; the executor coerces members against the schema.
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Provider-wire form for the assistant message's `tool_calls` array.
    pub fn to_wire(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": serde_json::to_string(&self.arguments).unwrap_or_default(),
            }
        })
    }
}

/// Response from a provider. `finish_reason == "error"` is the only failure
/// signal callers ever see out of the router.
#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
}

impl LLMResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: "stop".to_string(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: "error".to_string(),
        }
    }
}

/// A tool exposed to the model, in the `{"type":"function",...}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema: `{type, properties, required, enum, ...}`.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// One chat request as handed to a concrete provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Wire-shaped messages (see [`wire_messages`]).
    pub messages: Vec<Value>,
    /// Wire-shaped tool definitions; empty disables tool calling.
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Convert conversation messages to provider wire maps, dropping local-only
/// fields (timestamps).
pub fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = serde_json::Map::new();
            obj.insert("role".into(), serde_json::to_value(m.role).unwrap_or(Value::Null));
            obj.insert(
                "content".into(),
                serde_json::to_value(&m.content).unwrap_or(Value::Null),
            );
            if let Some(calls) = &m.tool_calls {
                obj.insert("tool_calls".into(), Value::Array(calls.clone()));
            }
            if let Some(id) = &m.tool_call_id {
                obj.insert("tool_call_id".into(), Value::String(id.clone()));
            }
            if let Some(name) = &m.name {
                obj.insert("name".into(), Value::String(name.clone()));
            }
            Value::Object(obj)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_core::types::Role;

    #[test]
    fn wire_messages_strip_timestamps() {
        let msgs = vec![ChatMessage::user("hi").with_timestamp("2026-01-01T00:00:00Z")];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"], "hi");
        assert!(wire[0].get("timestamp").is_none());
    }

    #[test]
    fn tool_call_wire_encodes_arguments_as_string() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "list_dir".into(),
            arguments: json!({"path": "."}),
        };
        let wire = call.to_wire();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "list_dir");
        let args: Value =
            serde_json::from_str(wire["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["path"], ".");
    }

    #[test]
    fn tool_message_keeps_call_linkage() {
        let msgs = vec![ChatMessage::tool_result("call_9", "read_file", "data")];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_9");
        assert_eq!(wire[0]["name"], "read_file");
        let _ = Role::Tool;
    }
}
