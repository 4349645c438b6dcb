//! `config {list,set,check,edit}` — JSON config management with dotted
//! paths. Sensitive values are masked in listings.

use clap::Subcommand;
use serde_json::Value;

use nanobot_core::config::{mask_sensitive, set_dotted};
use nanobot_core::NanobotConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (secrets masked).
    List,
    /// Set one value by dotted path, e.g. `brain.model gpt-4o`.
    Set { key: String, value: String },
    /// Validate that the config file parses against the schema.
    Check,
    /// Open the config file in $EDITOR.
    Edit,
}

pub fn run(action: ConfigAction) -> i32 {
    let path = nanobot_core::paths::config_path();
    match action {
        ConfigAction::List => {
            let cfg = match NanobotConfig::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("config error: {e}");
                    return 1;
                }
            };
            let value = serde_json::to_value(&cfg).unwrap_or(Value::Null);
            println!(
                "{}",
                serde_json::to_string_pretty(&mask_sensitive(&value)).unwrap_or_default()
            );
            0
        }
        ConfigAction::Set { key, value } => {
            let mut root: Value = match std::fs::read_to_string(&path) {
                Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| Value::Object(Default::default())),
                Err(_) => Value::Object(Default::default()),
            };
            // Accept JSON literals (numbers, booleans, objects); fall back to
            // a plain string.
            let parsed: Value =
                serde_json::from_str(&value).unwrap_or(Value::String(value.clone()));
            if let Err(e) = set_dotted(&mut root, &key, parsed) {
                eprintln!("{e}");
                return 1;
            }
            // Reject writes that would break the schema.
            if let Err(e) = serde_json::from_value::<NanobotConfig>(root.clone()) {
                eprintln!("refusing to write invalid config: {e}");
                return 1;
            }
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::write(&path, serde_json::to_string_pretty(&root).unwrap_or_default()) {
                Ok(()) => {
                    println!("{key} updated");
                    0
                }
                Err(e) => {
                    eprintln!("write failed: {e}");
                    1
                }
            }
        }
        ConfigAction::Check => match NanobotConfig::load(&path) {
            Ok(_) => {
                println!("config ok");
                0
            }
            Err(e) => {
                eprintln!("config invalid: {e}");
                1
            }
        },
        ConfigAction::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            if !path.exists() {
                let _ = NanobotConfig::default().save(&path);
            }
            match std::process::Command::new(editor).arg(&path).status() {
                Ok(status) if status.success() => 0,
                Ok(_) => 1,
                Err(e) => {
                    eprintln!("editor failed: {e}");
                    1
                }
            }
        }
    }
}
