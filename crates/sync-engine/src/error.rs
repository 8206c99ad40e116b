//! Engine error types.

use thiserror::Error;

/// Engine error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] sync_core::CoreError),

    /// Queue rejected the submission
    #[error("Queue error: {0}")]
    Outbox(#[from] sync_outbox::OutboxError),

    /// Session error
    #[error("Auth error: {0}")]
    Auth(#[from] sync_auth::AuthError),

    /// Transport setup error
    #[error("Transport error: {0}")]
    Transport(#[from] sync_transport::TransportError),

    /// Engine has been shut down
    #[error("Engine is shut down")]
    ShutDown,
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
