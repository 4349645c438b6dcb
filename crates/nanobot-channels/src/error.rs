use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}
