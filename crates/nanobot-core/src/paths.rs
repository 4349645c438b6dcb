//! Data-directory resolution and on-disk layout.
//!
//! Layout (everything below the data directory):
//!
//! ```text
//! config.json                 root configuration
//! gateway.pid                 PID lock
//! gateway.log                 process log
//! audit.log                   JSONL audit events
//! sessions/<safe-key>.jsonl   per-session logs
//! cron/jobs.json              cron state (atomic)
//! tasks.json                  named tasks (atomic)
//! runtime/failures.json       last 200 failure events
//! tool_configs/*.json         per-tool credentials
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{CoreError, Result};

/// Resolve the nanobot data directory.
///
/// Priority: `NANOBOT_HOME` env var, then a local `./.nanobot` if it already
/// exists, then `~/.nanobot` if it exists, defaulting to local `./.nanobot`.
pub fn data_dir() -> PathBuf {
    if let Some(root) = std::env::var_os("NANOBOT_HOME") {
        let p = PathBuf::from(root);
        let _ = std::fs::create_dir_all(&p);
        return p;
    }

    let local = PathBuf::from("./.nanobot");
    if local.is_dir() {
        return local;
    }
    if let Some(home) = dirs::home_dir() {
        let under_home = home.join(".nanobot");
        if under_home.is_dir() {
            return under_home;
        }
    }
    let _ = std::fs::create_dir_all(&local);
    local
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

pub fn pid_path() -> PathBuf {
    data_dir().join("gateway.pid")
}

pub fn log_path() -> PathBuf {
    data_dir().join("gateway.log")
}

pub fn audit_path() -> PathBuf {
    data_dir().join("audit.log")
}

pub fn sessions_dir() -> PathBuf {
    ensure_dir(data_dir().join("sessions"))
}

pub fn cron_jobs_path() -> PathBuf {
    let dir = ensure_dir(data_dir().join("cron"));
    dir.join("jobs.json")
}

pub fn tasks_path() -> PathBuf {
    data_dir().join("tasks.json")
}

pub fn runtime_failures_path() -> PathBuf {
    let dir = ensure_dir(data_dir().join("runtime"));
    dir.join("failures.json")
}

pub fn tool_configs_dir() -> PathBuf {
    ensure_dir(data_dir().join("tool_configs"))
}

/// Resolve the agent workspace. A local `workspace/` directory wins; otherwise
/// `<data>/workspace` is created.
pub fn workspace_dir() -> PathBuf {
    let local = PathBuf::from("workspace");
    if local.is_dir() {
        return local;
    }
    ensure_dir(data_dir().join("workspace"))
}

pub fn memory_dir(workspace: &Path) -> PathBuf {
    ensure_dir(workspace.join("memory"))
}

pub fn skills_dir(workspace: &Path) -> PathBuf {
    ensure_dir(workspace.join("skills"))
}

/// Create a directory (and parents) if missing, returning it.
pub fn ensure_dir(path: PathBuf) -> PathBuf {
    let _ = std::fs::create_dir_all(&path);
    path
}

/// Replace characters that are unsafe in filenames with underscores.
pub fn safe_filename(name: &str) -> String {
    const UNSAFE: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    name.trim()
        .chars()
        .map(|c| if UNSAFE.contains(&c) { '_' } else { c })
        .collect()
}

/// Serialize `value` as pretty JSON and atomically replace `path`
/// (write to a temp file in the same directory, then rename).
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoreError::InvalidPath(path.display().to_string()))?;
    std::fs::create_dir_all(parent)?;

    let json = serde_json::to_string_pretty(value)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::fs::write(tmp.path(), json)?;
    tmp.persist(path)
        .map_err(|e| CoreError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_replaces_unsafe_chars() {
        assert_eq!(safe_filename("telegram:12345"), "telegram_12345");
        assert_eq!(safe_filename("a/b\\c?d"), "a_b_c_d");
        assert_eq!(safe_filename("  plain  "), "plain");
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        atomic_write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["a"], 1);
    }
}
