//! PID lock for the gateway process.

use std::path::PathBuf;

use tracing::warn;

fn pid_file() -> PathBuf {
    nanobot_core::paths::pid_path()
}

/// Read the recorded PID, if any.
pub fn read_pid() -> Option<u32> {
    let text = std::fs::read_to_string(pid_file()).ok()?;
    text.trim().parse().ok()
}

/// Whether a process with this PID is alive (`kill -0` semantics).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Take the lock. Refuses when a live gateway holds it; silently replaces a
/// stale file left by a crashed process.
pub fn acquire() -> Result<(), String> {
    if let Some(pid) = read_pid() {
        if is_alive(pid) {
            return Err(format!(
                "gateway already running (pid {pid}); use `nanobot stop` first"
            ));
        }
        warn!(stale_pid = pid, "removing stale PID file");
    }
    std::fs::write(pid_file(), std::process::id().to_string())
        .map_err(|e| format!("cannot write PID file: {e}"))
}

/// Drop the lock if this process owns it.
pub fn release() {
    if read_pid() == Some(std::process::id()) {
        let _ = std::fs::remove_file(pid_file());
    }
}

/// Signal the recorded gateway process. Returns false when no signal could
/// be delivered.
#[cfg(unix)]
pub fn signal(pid: u32, sig: &str) -> bool {
    std::process::Command::new("kill")
        .args([sig, &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn signal(_pid: u32, _sig: &str) -> bool {
    false
}
