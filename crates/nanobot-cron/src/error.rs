use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<nanobot_core::CoreError> for CronError {
    fn from(e: nanobot_core::CoreError) -> Self {
        CronError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
