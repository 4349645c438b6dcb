use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use nanobot_core::types::ChatMessage;

use crate::openai::OpenAiCompatProvider;
use crate::provider::LlmProvider;
use crate::registry::ModelRegistry;
use crate::types::{wire_messages, ChatRequest, LLMResponse};

/// Mid-turn user notice emitted while failing over.
pub type PulseFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-candidate call timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Routes chat requests across the primary provider and the registry with
/// automatic failover. The caller never observes an error: when every
/// candidate fails the router synthesizes an `finish_reason:"error"` response.
pub struct ProviderRouter {
    primary: Arc<dyn LlmProvider>,
    model: String,
    registry: Arc<ModelRegistry>,
    max_tokens: u32,
    temperature: f32,
    pulse: Mutex<Option<PulseFn>>,
}

struct Candidate {
    name: String,
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ProviderRouter {
    pub fn new(
        primary: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        registry: Arc<ModelRegistry>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            primary,
            model: model.into(),
            registry,
            max_tokens,
            temperature,
            pulse: Mutex::new(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Install the pulse callback after composition (the bus outlives us).
    pub fn set_pulse(&self, pulse: PulseFn) {
        *self.pulse.lock().expect("pulse poisoned") = Some(pulse);
    }

    /// Call the model with failover. `tools` are wire-shaped definitions;
    /// pass an empty slice to forbid tool calls.
    pub async fn chat_with_failover(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> LLMResponse {
        let messages = wire_messages(messages);
        let candidates = self.build_candidates();
        let pulse = self.pulse.lock().expect("pulse poisoned").clone();

        let mut last_error = String::new();
        for (i, candidate) in candidates.iter().enumerate() {
            if i > 0 {
                if let Some(pulse) = &pulse {
                    pulse(format!(
                        "主模型响应异常，正在尝试备用大脑 ({})，请稍等...",
                        candidate.name
                    ))
                    .await;
                }
            }

            let req = ChatRequest {
                model: candidate.model.clone(),
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            };

            let outcome = tokio::time::timeout(CALL_TIMEOUT, candidate.provider.chat(&req)).await;
            match outcome {
                Ok(Ok(response)) if response.finish_reason != "error" => {
                    self.registry.report_success(&candidate.name);
                    return response;
                }
                Ok(Ok(response)) => {
                    last_error = response.content.unwrap_or_default();
                    warn!(provider = %candidate.name, error = %last_error, "provider returned error response");
                    self.registry.report_failure(&candidate.name, &last_error);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(provider = %candidate.name, error = %last_error, "provider call failed");
                    self.registry.report_failure(&candidate.name, &last_error);
                }
                Err(_) => {
                    last_error = format!("timed out after {}s", CALL_TIMEOUT.as_secs());
                    warn!(provider = %candidate.name, "provider call timed out");
                    self.registry.report_failure(&candidate.name, &last_error);
                }
            }
        }

        LLMResponse::error(format!(
            "抱歉老板，所有可用的大脑（共 {} 个）都暂时无法响应。最后一次错误：{}",
            candidates.len(),
            last_error
        ))
    }

    /// Primary first, then active registry entries, skipping any that point
    /// at the same endpoint + model as the primary.
    fn build_candidates(&self) -> Vec<Candidate> {
        let mut candidates = vec![Candidate {
            name: "primary".to_string(),
            provider: Arc::clone(&self.primary),
            model: self.model.clone(),
        }];

        for info in self.registry.get_active_providers(&self.model) {
            let model = info
                .default_model
                .clone()
                .unwrap_or_else(|| self.model.clone());
            if info.base_url == self.primary.api_base() && model == self.model {
                continue;
            }
            candidates.push(Candidate {
                name: info.name.clone(),
                provider: Arc::new(OpenAiCompatProvider::new(
                    info.name.clone(),
                    info.base_url.clone(),
                    info.api_key.clone(),
                    model.clone(),
                )),
                model,
            });
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysFail;

    #[async_trait]
    impl LlmProvider for AlwaysFail {
        fn name(&self) -> &str {
            "always-fail"
        }
        fn api_base(&self) -> &str {
            "https://fail.example/v1"
        }
        fn default_model(&self) -> &str {
            "m"
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<LLMResponse, ProviderError> {
            Err(ProviderError::Api {
                status: 503,
                message: "unavailable".to_string(),
            })
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl LlmProvider for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }
        fn api_base(&self) -> &str {
            "https://ok.example/v1"
        }
        fn default_model(&self) -> &str {
            "m"
        }
        async fn chat(&self, _req: &ChatRequest) -> Result<LLMResponse, ProviderError> {
            Ok(LLMResponse::text("ok"))
        }
    }

    #[tokio::test]
    async fn all_failures_yield_synthetic_error_response() {
        let router = ProviderRouter::new(
            Arc::new(AlwaysFail),
            "m",
            Arc::new(ModelRegistry::new()),
            256,
            0.7,
        );
        let resp = router.chat_with_failover(&[], &[]).await;
        assert_eq!(resp.finish_reason, "error");
        let content = resp.content.unwrap();
        assert!(content.contains("共 1 个"));
        assert!(!content.is_empty());
    }

    #[tokio::test]
    async fn primary_success_needs_no_pulse() {
        let pulses = Arc::new(AtomicUsize::new(0));
        let router = ProviderRouter::new(
            Arc::new(AlwaysOk),
            "m",
            Arc::new(ModelRegistry::new()),
            256,
            0.7,
        );
        let counter = pulses.clone();
        router.set_pulse(Arc::new(move |_text| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));
        let resp = router.chat_with_failover(&[], &[]).await;
        assert_eq!(resp.content.as_deref(), Some("ok"));
        assert_eq!(pulses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registry_entries_become_fallback_candidates() {
        let registry = Arc::new(ModelRegistry::new());
        registry.register("backup", "https://b.example/v1", "k", Some("m2"), true);
        registry.register("primary-dup", "https://fail.example/v1", "k", Some("m"), false);
        let router = ProviderRouter::new(Arc::new(AlwaysFail), "m", registry, 256, 0.7);

        let candidates = router.build_candidates();
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "backup"]);
        assert_eq!(candidates[1].model, "m2");
    }
}
