//! Outbox error types.

use sync_core::OperationId;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OutboxError {
    /// Startup reconciliation has not finished yet
    #[error("Queue is still recovering persisted operations")]
    RecoveryPending,

    /// The queue was shut down
    #[error("Queue is shut down")]
    ShutDown,

    /// An operation with this id is already queued
    #[error("Operation already queued: {0}")]
    DuplicateOperation(OperationId),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
