//! Dependency-ordered sync queue.
//!
//! The queue owns the lifecycle of every submitted operation. It writes
//! through to the durable store so a restart, or another instance on the
//! same device, can pick the work up again.
//!
//! ```text
//! enqueue ─► Created ─► Dispatching ─► Resolved
//!               ▲            │
//!   recovered ──┤            ├─► Retrying ─(deadline)─► eligible
//!   (Claimed)   │            ├─► requeued (auth/deferred)
//!               │            └─► Aborted ─► dependents aborted
//! ```

mod error;
mod policy;
mod queue;

pub use error::{OutboxError, OutboxResult};
pub use policy::{FailureClass, RetryDecision, RetryPolicy};
pub use queue::{QueueStatus, SyncQueue};
