//! Session state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//! ┌─────────────────┐
//! │  Disconnected   │ (initial) ◄──────────── LoggedOut / ConnectionLost
//! └────────┬────────┘
//!          │ ConnectivityAcquired / CachedSessionFound
//!          ▼
//! ┌─────────────────┐ ◄── CredentialRejected
//! │    Connected    │ ◄──────────────────────────────┐
//! └────────┬────────┘                                │
//!          │ SessionIssued / CachedSessionAccepted   │ ChallengeStarted
//!          ▼                                         │
//! ┌─────────────────┐   TokenRejected   ┌─────────────────┐
//! │  Authenticated  │ ────────────────► │ Deauthenticated │
//! └────────┬────────┘                   └─────────────────┘
//!          │ LocalStateReady                  ▲
//!          ▼                                  │
//! ┌─────────────────┐   TokenRejected         │
//! │      Ready      │ ────────────────────────┘
//! └─────────────────┘
//! ```

use rust_fsm::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub session_machine(Disconnected)

    Disconnected => {
        ConnectivityAcquired => Connected,
        CachedSessionFound => Connected
    },
    Connected => {
        SessionIssued => Authenticated,
        CachedSessionAccepted => Authenticated,
        // Stays connected so the caller can retry without reconnecting
        CredentialRejected => Connected,
        ConnectionLost => Disconnected
    },
    Authenticated => {
        LocalStateReady => Ready,
        TokenRejected => Deauthenticated,
        LoggedOut => Disconnected
    },
    Ready => {
        TokenRejected => Deauthenticated,
        LoggedOut => Disconnected
    },
    Deauthenticated => {
        ChallengeStarted => Connected,
        LoggedOut => Disconnected
    }
}

pub use session_machine::Input as SessionMachineInput;
pub use session_machine::State as SessionMachineState;
pub use session_machine::StateMachine as SessionMachine;

/// Serializable view of the machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connected,
    Authenticated,
    Ready,
    Deauthenticated,
}

impl SessionState {
    /// A session token is held only in these states.
    pub fn has_token(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Ready)
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

impl From<&SessionMachineState> for SessionState {
    fn from(state: &SessionMachineState) -> Self {
        match state {
            SessionMachineState::Disconnected => SessionState::Disconnected,
            SessionMachineState::Connected => SessionState::Connected,
            SessionMachineState::Authenticated => SessionState::Authenticated,
            SessionMachineState::Ready => SessionState::Ready,
            SessionMachineState::Deauthenticated => SessionState::Deauthenticated,
        }
    }
}

/// Backoff for repeating the challenge after a rejected token.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Maximum number of challenge attempts.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

impl RefreshConfig {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}
