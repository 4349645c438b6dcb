use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::{LlmProvider, ProviderError};
use crate::types::{ChatRequest, LLMResponse, ToolCallRequest};

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn api_base(&self) -> &str {
        &self.base_url
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(&self, req: &ChatRequest) -> Result<LLMResponse, ProviderError> {
        let mut body = json!({
            "model": req.model,
            "messages": req.messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.clone());
        }

        debug!(provider = %self.name, model = %req.model, "chat request");
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        let payload: Value = response.json().await?;
        parse_chat_completion(&payload)
    }
}

/// Extract content + tool calls from a chat-completion payload.
fn parse_chat_completion(payload: &Value) -> Result<LLMResponse, ProviderError> {
    let choice = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| ProviderError::Parse("choice has no message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            // Arguments arrive as a JSON-encoded string; tolerate raw objects.
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or_else(|_| json!({}))
                }
                Some(Value::Object(o)) => Value::Object(o.clone()),
                _ => json!({}),
            };
            tool_calls.push(ToolCallRequest { id, name, arguments });
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();

    Ok(LLMResponse {
        content,
        tool_calls,
        finish_reason,
    })
}
