//! Failure classes and the retry decision.

use std::time::Duration;
use sync_core::RetryConfig;

/// How a failed dispatch should be treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network trouble; consumes one retry.
    Transient,
    /// The transport could not carry the operation right now; no retry consumed.
    Deferred,
    /// The session token was rejected; replayed after reauthentication.
    AuthExpired,
    /// The server refused the operation.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded exponential backoff over [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Decide what happens after the `retry_count`-th transient failure.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count > self.config.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.config.delay_for_retry(retry_count))
        }
    }
}
