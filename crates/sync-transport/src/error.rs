//! Transport error types.

use thiserror::Error;

/// Transport error type.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Host could not be reached
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Attempt exceeded the client timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Other HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint could not be resolved
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Persistent channel is not open
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Unreachable(_)
            | TransportError::Timeout(_)
            | TransportError::ChannelClosed => true,
            TransportError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            TransportError::InvalidUrl(_) | TransportError::Json(_) => false,
        }
    }
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
