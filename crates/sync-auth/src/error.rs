//! Authentication error types.

use thiserror::Error;

/// Authentication error type.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Connectivity challenge failed (transient, can retry)
    #[error("Connectivity unavailable: {0}")]
    ConnectivityUnavailable(String),

    /// The service refused the credential
    #[error("Credentials rejected: {0}")]
    CredentialsRejected(String),

    /// Service answered with a server error
    #[error("Auth service error: HTTP {0}")]
    Service(u16),

    /// Challenge retries exhausted
    #[error("Reauthentication failed after {0} attempts")]
    RefreshExhausted(u32),

    /// No user to authenticate as
    #[error("Not logged in")]
    NotLoggedIn,

    /// Invalid state transition in the session FSM
    #[error("Invalid session state transition: {0}")]
    InvalidStateTransition(String),

    /// Unexpected response body
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl AuthError {
    /// Returns true if this error is transient and the challenge can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::ConnectivityUnavailable(_) => true,
            AuthError::Service(status) => *status >= 500,
            AuthError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                false
            }
            _ => false,
        }
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;
