//! `status` / `logs`: configuration summary, runtime snapshot, log viewing.

use nanobot_core::{config, AuditLog, FailureStore, NanobotConfig};
use nanobot_sessions::SessionStore;

use crate::pid;

pub fn print_status() -> i32 {
    let data_dir = nanobot_core::paths::data_dir();
    let config_path = nanobot_core::paths::config_path();
    let cfg = match NanobotConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return 1;
        }
    };

    println!("nanobot status");
    println!("  data dir:    {}", data_dir.display());
    println!("  workspace:   {}", nanobot_core::paths::workspace_dir().display());
    println!("  model:       {}", cfg.brain.model);
    println!("  timezone:    {}", cfg.brain.timezone);
    println!(
        "  providers:   {}",
        configured_providers(&cfg).join(", ")
    );
    println!(
        "  channels:    {}",
        if cfg.channels.is_empty() {
            "none".to_string()
        } else {
            cfg.channels
                .iter()
                .map(|(name, c)| {
                    format!("{name}({})", if c.enabled { "on" } else { "off" })
                })
                .collect::<Vec<_>>()
                .join(", ")
        }
    );

    match pid::read_pid() {
        Some(p) if pid::is_alive(p) => println!("  gateway:     running (pid {p})"),
        Some(p) => println!("  gateway:     not running (stale pid {p})"),
        None => println!("  gateway:     not running"),
    }

    let sessions = SessionStore::new(nanobot_core::paths::sessions_dir());
    let listed = sessions.list();
    println!("  sessions:    {}", listed.len());
    if let Some((key, updated)) = listed.first() {
        println!("  latest:      {key} ({updated})");
    }

    let failures = FailureStore::default_location();
    println!("  recent failures:");
    for line in failures.summarize_recent(5).lines() {
        println!("    {line}");
    }
    0
}

fn configured_providers(cfg: &NanobotConfig) -> Vec<String> {
    let mut names = Vec::new();
    let entries: [(&str, &Option<config::ProviderCredential>); 5] = [
        ("openai", &cfg.providers.openai),
        ("anthropic", &cfg.providers.anthropic),
        ("deepseek", &cfg.providers.deepseek),
        ("openrouter", &cfg.providers.openrouter),
        ("gemini", &cfg.providers.gemini),
    ];
    for (name, cred) in entries {
        if cred.is_some() {
            names.push(name.to_string());
        }
    }
    for entry in &cfg.brain.provider_registry {
        names.push(format!("{} (registry)", entry.name));
    }
    if names.is_empty() {
        names.push("none".to_string());
    }
    names
}

pub fn show_logs(audit: bool, lines: usize, follow: bool) -> i32 {
    if audit {
        let log = AuditLog::default_location();
        for event in log.tail(lines) {
            println!("{}", serde_json::to_string(&event).unwrap_or_default());
        }
        if follow {
            return follow_file(log.path().clone());
        }
        return 0;
    }

    // The process log rotates daily: gateway.log.YYYY-MM-DD.
    let data_dir = nanobot_core::paths::data_dir();
    let today = chrono::Local::now().format("%Y-%m-%d");
    let candidates = [
        data_dir.join(format!("gateway.log.{today}")),
        data_dir.join("gateway.log"),
    ];
    let Some(path) = candidates.iter().find(|p| p.exists()) else {
        eprintln!("no gateway log found under {}", data_dir.display());
        return 1;
    };

    let Ok(text) = std::fs::read_to_string(path) else {
        eprintln!("cannot read {}", path.display());
        return 1;
    };
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    if follow {
        return follow_file(path.clone());
    }
    0
}

/// Poll-based tail -f; exits only on ctrl-c.
fn follow_file(path: std::path::PathBuf) -> i32 {
    let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let len = meta.len();
        if len < offset {
            offset = 0;
        }
        if len > offset {
            if let Ok(text) = std::fs::read_to_string(&path) {
                let bytes = text.as_bytes();
                if let Ok(chunk) = std::str::from_utf8(&bytes[offset as usize..]) {
                    print!("{chunk}");
                }
            }
            offset = len;
        }
    }
}
