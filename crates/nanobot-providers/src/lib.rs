//! `nanobot-providers` — LLM access: the provider trait, the
//! OpenAI-compatible HTTP client, the failover registry, and the router.

pub mod openai;
pub mod provider;
pub mod registry;
pub mod router;
pub mod types;

pub use openai::OpenAiCompatProvider;
pub use provider::{LlmProvider, ProviderError};
pub use registry::{ModelRegistry, ProviderInfo};
pub use router::{ProviderRouter, PulseFn};
pub use types::{ChatRequest, LLMResponse, ToolCallRequest, ToolDefinition};
