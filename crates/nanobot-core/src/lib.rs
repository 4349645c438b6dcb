//! `nanobot-core` — configuration, filesystem layout, and the shared data
//! model every other crate builds on.
//!
//! Nothing in here talks to the network or an LLM. The crate owns:
//!
//! - the typed configuration tree (`config.json` + `NANOBOT_*` env overrides)
//! - data-directory resolution and the on-disk layout helpers
//! - the bus message types (`InboundMessage`, `OutboundMessage`) and the
//!   conversation message shape (`ChatMessage`)
//! - the JSONL audit log and the bounded runtime-failure store

pub mod audit;
pub mod config;
pub mod error;
pub mod failures;
pub mod paths;
pub mod types;

pub use audit::AuditLog;
pub use config::NanobotConfig;
pub use error::{CoreError, Result};
pub use failures::FailureStore;
pub use types::{ChatMessage, InboundMessage, MessageContent, OutboundMessage, Role};
