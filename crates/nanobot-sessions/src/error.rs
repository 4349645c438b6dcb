use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {key}")]
    NotFound { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt session line: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<nanobot_core::CoreError> for SessionError {
    fn from(e: nanobot_core::CoreError) -> Self {
        SessionError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
