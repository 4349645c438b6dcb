use serde::{Deserialize, Serialize};

/// Execution lanes for the command queue.
///
/// - `Main`: user-visible requests, strictly serial by default.
/// - `Background`: system/cron work that must not block users.
/// - `Probe`: liveness and connectivity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandLane {
    Main,
    Background,
    Probe,
}

impl CommandLane {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandLane::Main => "main",
            CommandLane::Background => "background",
            CommandLane::Probe => "probe",
        }
    }
}

impl std::fmt::Display for CommandLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
