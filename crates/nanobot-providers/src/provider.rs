use async_trait::async_trait;

use crate::types::{ChatRequest, LLMResponse};

/// Common interface for LLM backends.
///
/// A provider converts one [`ChatRequest`] into one [`LLMResponse`]. It never
/// retries and never fails silently; failover lives in the router.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name for logging and pulse messages.
    fn name(&self) -> &str;

    /// Endpoint base URL, used for duplicate-candidate detection.
    fn api_base(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn chat(&self, req: &ChatRequest) -> Result<LLMResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("provider call timed out after {secs}s")]
    Timeout { secs: u64 },
}
