use std::time::Duration;

use forum_api::ForumError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecountError>;

#[derive(Debug, Error)]
pub enum RecountError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Forum(ForumError),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run deadline of {}s exceeded during {stage}", .deadline.as_secs_f64())]
    DeadlineExceeded { deadline: Duration, stage: String },

    #[error("A recount run is already in progress")]
    AlreadyRunning,
}

impl From<ForumError> for RecountError {
    fn from(err: ForumError) -> Self {
        if err.is_cancelled() {
            RecountError::Cancelled
        } else {
            RecountError::Forum(err)
        }
    }
}
