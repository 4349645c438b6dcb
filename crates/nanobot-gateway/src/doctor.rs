//! `health` / `check` / `tools-health`: diagnostics without touching a
//! running gateway.

use std::collections::BTreeMap;

use serde_json::Value;

use nanobot_core::{AuditLog, NanobotConfig};
use nanobot_cron::CronStore;
use nanobot_providers::ModelRegistry;

use crate::pid;

struct Findings {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Findings {
    fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

pub fn health(strict: bool, require_gateway: bool) -> i32 {
    let mut findings = Findings::new();

    // Data dir must be writable.
    let data_dir = nanobot_core::paths::data_dir();
    let probe = data_dir.join(".health_probe");
    match std::fs::write(&probe, "ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
        }
        Err(e) => findings.error(format!("data dir not writable: {e}")),
    }

    // Config must parse.
    let config = match NanobotConfig::load(&nanobot_core::paths::config_path()) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            findings.error(format!("config unreadable: {e}"));
            None
        }
    };

    if let Some(cfg) = &config {
        let any_provider = cfg.providers.openai.is_some()
            || cfg.providers.anthropic.is_some()
            || cfg.providers.deepseek.is_some()
            || cfg.providers.openrouter.is_some()
            || cfg.providers.gemini.is_some()
            || !cfg.brain.provider_registry.is_empty();
        if !any_provider {
            findings.warn("no LLM provider configured; the agent will answer with failover errors");
        }
    }

    // Cron store must parse (an unreadable file loads as empty, so inspect
    // the raw document when it exists).
    let cron_path = nanobot_core::paths::cron_jobs_path();
    if cron_path.exists() {
        match std::fs::read_to_string(&cron_path) {
            Ok(text) if serde_json::from_str::<Value>(&text).is_err() => {
                findings.error("cron/jobs.json is corrupt JSON");
            }
            Err(e) => findings.warn(format!("cron store unreadable: {e}")),
            _ => {
                let jobs = CronStore::new(cron_path).load();
                let stuck = jobs
                    .iter()
                    .filter(|j| j.enabled && j.state.next_run_at_ms.is_none())
                    .count();
                if stuck > 0 {
                    findings.warn(format!("{stuck} enabled cron job(s) without a next run"));
                }
            }
        }
    }

    match pid::read_pid() {
        Some(p) if pid::is_alive(p) => {}
        Some(p) => {
            if require_gateway {
                findings.error(format!("gateway not running (stale pid {p})"));
            } else {
                findings.warn(format!("stale PID file (pid {p})"));
            }
        }
        None => {
            if require_gateway {
                findings.error("gateway not running");
            }
        }
    }

    for w in &findings.warnings {
        println!("WARN  {w}");
    }
    for e in &findings.errors {
        println!("ERROR {e}");
    }
    if findings.errors.is_empty() && findings.warnings.is_empty() {
        println!("ok");
    }

    if !findings.errors.is_empty() || (strict && !findings.warnings.is_empty()) {
        1
    } else {
        0
    }
}

pub fn check(quick: bool) -> i32 {
    let cfg = match NanobotConfig::load(&nanobot_core::paths::config_path()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return 1;
        }
    };

    let mut failed = false;

    // Browser binaries are optional; report, never fail.
    for binary in ["chromium", "chromium-browser", "google-chrome"] {
        if binary_on_path(binary) {
            println!("browser: found {binary}");
        }
    }

    if quick {
        println!("quick mode: skipping network probes");
        return 0;
    }

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(async {
        // Basic network reachability.
        let client = reqwest::Client::new();
        match client
            .get("https://www.baidu.com")
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) => println!("network: ok ({})", resp.status()),
            Err(e) => {
                println!("network: FAILED ({e})");
                failed = true;
            }
        }

        // Model endpoints from the failover registry.
        let registry = ModelRegistry::new();
        for entry in &cfg.brain.provider_registry {
            registry.register(
                &entry.name,
                &entry.base_url,
                &entry.api_key,
                entry.default_model.as_deref(),
                entry.is_free,
            );
            registry.probe(&entry.name).await;
            match registry.get(&entry.name).and_then(|i| i.error) {
                None => println!("provider {}: ok", entry.name),
                Some(e) => {
                    println!("provider {}: FAILED ({e})", entry.name);
                    failed = true;
                }
            }
        }
    });

    if failed {
        1
    } else {
        0
    }
}

#[derive(Default)]
struct ToolStats {
    calls: usize,
    ok: usize,
    errors: usize,
    timeouts: usize,
    total_duration_s: f64,
}

/// Aggregate `tool_end` events from the audit log into per-tool stats.
pub fn tools_health() -> i32 {
    let audit = AuditLog::default_location();
    let events = audit.tail(usize::MAX);
    let mut stats: BTreeMap<String, ToolStats> = BTreeMap::new();

    for event in &events {
        if event.get("type").and_then(Value::as_str) != Some("tool_end") {
            continue;
        }
        let tool = event
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let entry = stats.entry(tool).or_default();
        entry.calls += 1;
        match event.get("status").and_then(Value::as_str) {
            Some("ok") => entry.ok += 1,
            Some("timeout") => entry.timeouts += 1,
            _ => entry.errors += 1,
        }
        if let Some(d) = event.get("duration_s").and_then(Value::as_f64) {
            entry.total_duration_s += d;
        }
    }

    if stats.is_empty() {
        println!("no tool calls recorded yet");
        return 0;
    }

    println!(
        "{:<20} {:>6} {:>6} {:>7} {:>8} {:>9}",
        "tool", "calls", "ok", "errors", "timeouts", "avg(s)"
    );
    for (tool, s) in &stats {
        println!(
            "{:<20} {:>6} {:>6} {:>7} {:>8} {:>9.3}",
            tool,
            s.calls,
            s.ok,
            s.errors,
            s.timeouts,
            s.total_duration_s / s.calls.max(1) as f64
        );
    }
    0
}

fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}
