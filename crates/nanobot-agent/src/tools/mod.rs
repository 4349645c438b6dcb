//! Tool system: the `Tool` trait, rich results, and the registry.

pub mod cron_tool;
pub mod memory_tool;
pub mod message;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::{ToolMeta, ToolRegistry};

/// How bad a failed tool call is, as shown to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolSeverity {
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for ToolSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolSeverity::Info => "info",
            ToolSeverity::Warn => "warn",
            ToolSeverity::Error => "error",
            ToolSeverity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Result of one tool execution, as threaded back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub remedy: Option<String>,
    #[serde(default)]
    pub severity: ToolSeverity,
    #[serde(default)]
    pub should_retry: bool,
    #[serde(default)]
    pub requires_user_confirmation: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            remedy: None,
            severity: ToolSeverity::Info,
            should_retry: false,
            requires_user_confirmation: false,
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            remedy: None,
            severity: ToolSeverity::Error,
            should_retry: false,
            requires_user_confirmation: false,
        }
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remedy = Some(remedy.into());
        self
    }
}

/// Where the current turn's output should be delivered. Stateful tools
/// (message, cron) are told this before each turn.
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub trace_id: Option<String>,
}

/// Interface every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "cron").
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the parameters object.
    fn parameters(&self) -> Value;

    /// Execute with already-coerced parameters.
    async fn execute(&self, params: Value) -> ToolResult;

    /// Receive the current delivery context. Default: stateless, ignore.
    fn set_context(&self, _ctx: &DeliveryContext) {}
}
