//! Offline sync engine.
//!
//! Ties the queue, the dispatcher and the session manager together:
//!
//! ```text
//! submit ──► SyncQueue ──dequeue──► Dispatcher ──► RequestResponse / PersistentChannel
//!               ▲                        │
//!               └──── on_resolved / on_failed ◄── outcome
//!                                        │ 401
//!                                        ▼
//!                               SessionManager::mark_stale → reauthenticate
//! ```
//!
//! Background tasks keep this instance's heartbeat fresh, adopt work from
//! instances that stopped, and follow connectivity changes.

mod engine;
mod error;
mod handle;
mod worker;

pub use engine::{EngineDeps, EngineStatus, SyncEngine};
pub use error::{EngineError, EngineResult};
pub use handle::{OperationHandle, OperationOutcome};

#[cfg(test)]
mod tests;
