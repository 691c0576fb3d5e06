//! Error types for c9-lifecycle

use thiserror::Error;

/// Errors raised while handling a custom-resource event.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The event document is malformed or missing required fields
    #[error("invalid custom-resource event: {0}")]
    InvalidEvent(String),

    /// The pre-signed response URL rejected the response document
    #[error("response callback returned {status}: {body}")]
    Callback { status: u16, body: String },

    /// Transport failure while sending the response
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LifecycleError {
    fn from(err: reqwest::Error) -> Self {
        LifecycleError::Http(err.to_string())
    }
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
