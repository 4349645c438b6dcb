use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Top-level config (`<data>/config.json` + `NANOBOT_<SECTION>__<KEY>` env
/// overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NanobotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub brain: BrainConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

/// LLM behaviour knobs shared by the turn engine and context builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Hard per-turn budget on executed tool calls.
    #[serde(default = "default_max_total_tool_calls")]
    pub max_total_tool_calls: usize,
    /// Wall-clock budget for one turn, seconds.
    #[serde(default = "default_max_turn_seconds")]
    pub max_turn_seconds: u64,
    /// IANA timezone for all user-facing timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Inject the `<think>` reasoning-format instruction into the prompt.
    /// Suppressed automatically for models that natively reason.
    #[serde(default = "bool_true")]
    pub reasoning: bool,
    #[serde(default = "bool_true")]
    pub auto_summarize: bool,
    /// Message count past which proactive history compaction kicks in.
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    /// Extra failover providers beyond the primary.
    #[serde(default)]
    pub provider_registry: Vec<RegistryEntry>,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
            max_total_tool_calls: default_max_total_tool_calls(),
            max_turn_seconds: default_max_turn_seconds(),
            timezone: default_timezone(),
            reasoning: true,
            auto_summarize: true,
            summary_threshold: default_summary_threshold(),
            provider_registry: Vec::new(),
        }
    }
}

/// One failover provider registered alongside the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub is_free: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub openai: Option<ProviderCredential>,
    pub anthropic: Option<ProviderCredential>,
    pub deepseek: Option<ProviderCredential>,
    pub openrouter: Option<ProviderCredential>,
    pub gemini: Option<ProviderCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Lane depth (active + queued) at which the busy notice fires.
    #[serde(default = "default_busy_threshold")]
    pub busy_notice_threshold: usize,
    /// Minimum seconds between busy notices, shared across all lanes.
    #[serde(default = "default_busy_debounce")]
    pub busy_notice_debounce_seconds: f64,
    /// Where critical errors go when the origin is unknown.
    #[serde(default = "default_fallback_channel")]
    pub error_fallback_channel: String,
    #[serde(default = "default_fallback_chat_id")]
    pub error_fallback_chat_id: String,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            busy_notice_threshold: default_busy_threshold(),
            busy_notice_debounce_seconds: default_busy_debounce(),
            error_fallback_channel: default_fallback_channel(),
            error_fallback_chat_id: default_fallback_chat_id(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Web-tool exposure policy (see `ToolPolicy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_web_default")]
    pub web_default: String,
    #[serde(default = "bool_true")]
    pub enable_mcp_fallback: bool,
    #[serde(default = "bool_true")]
    pub allow_explicit_mcp: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            web_default: default_web_default(),
            enable_mcp_fallback: true,
            allow_explicit_mcp: true,
        }
    }
}

/// Per-channel enablement and allowlist.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelEntry {
    #[serde(default)]
    pub enabled: bool,
    /// Sender ids allowed to talk to the agent. Empty means allow everyone.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl NanobotConfig {
    /// Load config from `path`, layered as defaults < file < env.
    ///
    /// Env overrides use Pydantic-style nesting:
    /// `NANOBOT_BRAIN__MODEL=gpt-4o` sets `brain.model`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(NanobotConfig::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        }
        figment
            .merge(Env::prefixed("NANOBOT_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Pretty-print to `path` (plain write; config edits are interactive).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Keys whose values must never be printed by `config list`.
const SENSITIVE_MARKERS: &[&str] = &["api_key", "token", "password", "secret"];

/// Recursively mask values of sensitive keys for display.
pub fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let lower = k.to_lowercase();
                let sensitive = SENSITIVE_MARKERS.iter().any(|m| lower.contains(m));
                if sensitive && v.is_string() {
                    let masked = match v.as_str() {
                        Some(s) if s.chars().count() > 6 => {
                            format!("{}***", s.chars().take(4).collect::<String>())
                        }
                        _ => "***".to_string(),
                    };
                    out.insert(k.clone(), Value::String(masked));
                } else {
                    out.insert(k.clone(), mask_sensitive(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

/// Set `root.a.b.c = new_value` for a dotted path, creating objects as needed.
pub fn set_dotted(root: &mut Value, dotted: &str, new_value: Value) -> Result<()> {
    let mut current = root;
    let parts: Vec<&str> = dotted.split('.').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(CoreError::Config(format!("invalid config path: {dotted}")));
    }
    for part in &parts[..parts.len() - 1] {
        if !current.is_object() {
            return Err(CoreError::Config(format!(
                "config path {dotted} crosses a non-object value"
            )));
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    match current.as_object_mut() {
        Some(map) => {
            map.insert(parts[parts.len() - 1].to_string(), new_value);
            Ok(())
        }
        None => Err(CoreError::Config(format!(
            "config path {dotted} crosses a non-object value"
        ))),
    }
}

fn default_port() -> u16 {
    18790
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_iterations() -> usize {
    20
}

fn default_max_total_tool_calls() -> usize {
    30
}

fn default_max_turn_seconds() -> u64 {
    45
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_summary_threshold() -> usize {
    50
}

fn default_busy_threshold() -> usize {
    1
}

fn default_busy_debounce() -> f64 {
    30.0
}

fn default_fallback_channel() -> String {
    "cli".to_string()
}

fn default_fallback_chat_id() -> String {
    "direct".to_string()
}

fn default_web_default() -> String {
    "tavily".to_string()
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NanobotConfig::default();
        assert_eq!(cfg.brain.max_total_tool_calls, 30);
        assert_eq!(cfg.brain.max_turn_seconds, 45);
        assert_eq!(cfg.brain.timezone, "Asia/Shanghai");
        assert_eq!(cfg.tools.policy.web_default, "tavily");
        assert_eq!(cfg.tools.error_fallback_channel, "cli");
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"brain": {"model": "deepseek-chat"}}"#).unwrap();
        let cfg = NanobotConfig::load(&path).unwrap();
        assert_eq!(cfg.brain.model, "deepseek-chat");
        assert_eq!(cfg.brain.max_iterations, 20);
    }

    #[test]
    fn mask_hides_api_keys() {
        let value = serde_json::json!({
            "providers": {"openai": {"api_key": "sk-verysecretkey", "api_base": null}}
        });
        let masked = mask_sensitive(&value);
        assert_eq!(masked["providers"]["openai"]["api_key"], "sk-v***");
        assert!(masked["providers"]["openai"]["api_base"].is_null());
    }

    #[test]
    fn set_dotted_creates_nested_objects() {
        let mut root = serde_json::json!({});
        set_dotted(&mut root, "tools.policy.web_default", Value::String("browser".into()))
            .unwrap();
        assert_eq!(root["tools"]["policy"]["web_default"], "browser");
    }
}
