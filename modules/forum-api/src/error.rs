use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForumError>;

#[derive(Debug, Error)]
pub enum ForumError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("API error ({code}): {message}")]
    Api { code: String, message: String },

    #[error("Request '{label}' failed after {attempts} attempts: {source}")]
    RequestFailed {
        label: String,
        attempts: u32,
        #[source]
        source: Box<ForumError>,
    },

    #[error("Pagination overrun: endpoint returned full pages for {max_pages} requests")]
    PaginationOverrun { max_pages: u32 },

    #[error("Request cancelled")]
    Cancelled,
}

impl ForumError {
    /// Transport, shape and server-reported failures share one retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForumError::Network(_)
                | ForumError::Timeout(_)
                | ForumError::Http { .. }
                | ForumError::MalformedResponse(_)
                | ForumError::Api { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            ForumError::Cancelled => true,
            ForumError::RequestFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The innermost cause, unwrapping retry exhaustion.
    pub fn root_cause(&self) -> &ForumError {
        match self {
            ForumError::RequestFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for ForumError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ForumError::Timeout(err.to_string())
        } else {
            ForumError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ForumError {
    fn from(err: serde_json::Error) -> Self {
        ForumError::MalformedResponse(err.to_string())
    }
}
