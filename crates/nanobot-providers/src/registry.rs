use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Cooldown grows with consecutive failures: 30s, 60s, 120s … capped at 10min.
const COOLDOWN_BASE_MS: i64 = 30_000;
const COOLDOWN_CAP_MS: i64 = 600_000;

/// A registered failover provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cooldown_until_ms: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Registry of failover providers with failure-driven cooldowns.
pub struct ModelRegistry {
    providers: Mutex<HashMap<String, ProviderInfo>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        name: &str,
        base_url: &str,
        api_key: &str,
        default_model: Option<&str>,
        is_free: bool,
    ) -> ProviderInfo {
        let info = ProviderInfo {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: default_model.map(str::to_string),
            models: Vec::new(),
            is_free,
            balance: 0.0,
            currency: default_currency(),
            error: None,
            cooldown_until_ms: 0,
            consecutive_failures: 0,
        };
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .insert(name.to_string(), info.clone());
        debug!(provider = %name, base_url = %base_url, "provider registered");
        info
    }

    pub fn get(&self, name: &str) -> Option<ProviderInfo> {
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut all: Vec<ProviderInfo> = self
            .providers
            .lock()
            .expect("provider registry poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Providers eligible for failover right now: cooldown expired, free
    /// entries first, then by name for determinism.
    pub fn get_active_providers(&self, model: &str) -> Vec<ProviderInfo> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut active: Vec<ProviderInfo> = self
            .providers
            .lock()
            .expect("provider registry poisoned")
            .values()
            .filter(|p| p.cooldown_until_ms <= now)
            .filter(|p| {
                p.default_model.is_some()
                    || p.models.iter().any(|m| m == model)
            })
            .cloned()
            .collect();
        active.sort_by(|a, b| (!a.is_free, &a.name).cmp(&(!b.is_free, &b.name)));
        active
    }

    /// Mark a candidate failed: grow its cooldown and record the error.
    pub fn report_failure(&self, name: &str, error: &str) {
        let mut providers = self.providers.lock().expect("provider registry poisoned");
        if let Some(info) = providers.get_mut(name) {
            info.consecutive_failures += 1;
            let backoff = (COOLDOWN_BASE_MS << (info.consecutive_failures - 1).min(8))
                .min(COOLDOWN_CAP_MS);
            info.cooldown_until_ms = chrono::Utc::now().timestamp_millis() + backoff;
            info.error = Some(error.chars().take(300).collect());
            warn!(
                provider = %name,
                failures = info.consecutive_failures,
                cooldown_ms = backoff,
                "provider cooling down"
            );
        }
    }

    /// A success clears failure state so the provider re-enters rotation.
    pub fn report_success(&self, name: &str) {
        let mut providers = self.providers.lock().expect("provider registry poisoned");
        if let Some(info) = providers.get_mut(name) {
            info.consecutive_failures = 0;
            info.cooldown_until_ms = 0;
            info.error = None;
        }
    }

    /// Probe `GET {base}/models` to populate the model list, recording an
    /// error string on failure. Used by `check` and registration.
    pub async fn probe(&self, name: &str) {
        let Some(info) = self.get(name) else { return };
        let client = reqwest::Client::new();
        let url = format!("{}/models", info.base_url);
        let outcome = async {
            let response = client
                .get(&url)
                .bearer_auth(&info.api_key)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await?;
            if !response.status().is_success() {
                return Ok::<_, reqwest::Error>(Err(format!(
                    "Failed to list models: {}",
                    response.status()
                )));
            }
            let payload: Value = response.json().await?;
            let models = payload
                .get("data")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|m| m.get("id").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Ok(Ok(models))
        }
        .await;

        let mut providers = self.providers.lock().expect("provider registry poisoned");
        if let Some(entry) = providers.get_mut(name) {
            match outcome {
                Ok(Ok(models)) => {
                    entry.models = models;
                    entry.error = None;
                }
                Ok(Err(msg)) => entry.error = Some(msg),
                Err(e) => entry.error = Some(e.to_string()),
            }
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_provider_leaves_rotation_until_cooldown() {
        let registry = ModelRegistry::new();
        registry.register("backup", "https://api.example.com/v1", "k", Some("m1"), true);

        assert_eq!(registry.get_active_providers("m1").len(), 1);
        registry.report_failure("backup", "503");
        assert!(registry.get_active_providers("m1").is_empty());

        // Success resets the cooldown immediately.
        registry.report_success("backup");
        assert_eq!(registry.get_active_providers("m1").len(), 1);
    }

    #[test]
    fn cooldown_grows_with_consecutive_failures() {
        let registry = ModelRegistry::new();
        registry.register("flaky", "https://x/v1", "k", Some("m"), false);
        registry.report_failure("flaky", "first");
        let first = registry.get("flaky").unwrap().cooldown_until_ms;
        registry.report_failure("flaky", "second");
        let second = registry.get("flaky").unwrap().cooldown_until_ms;
        assert!(second > first);
        assert_eq!(registry.get("flaky").unwrap().consecutive_failures, 2);
    }

    #[test]
    fn free_providers_rank_first() {
        let registry = ModelRegistry::new();
        registry.register("paid", "https://a/v1", "k", Some("m"), false);
        registry.register("free", "https://b/v1", "k", Some("m"), true);
        let active = registry.get_active_providers("m");
        assert_eq!(active[0].name, "free");
    }
}
