//! Durable queue store for the offline sync core.
//!
//! This crate provides:
//! - [`StorageBackend`]: the table-oriented storage collaborator contract
//! - [`SqliteBackend`]: SQLite implementation safe to share between processes
//! - [`MemoryBackend`]: in-process implementation for tests and embedders
//! - [`DurableQueueStore`]: the operation ledger the sync queue writes through,
//!   including the atomic claim and the degrade-to-no-op behavior
//!
//! ## Claim
//!
//! ```text
//! instance A                        store                       instance B
//!   take_if(op, owner == X) ───────► row exists, owner X
//!                                   delete, return row ───────► take_if(op, owner == X)
//!   re-append(op, owner = A)                                    row gone → lost race
//! ```

mod backend;
mod error;
mod memory;
mod queue_store;
mod sqlite;

pub use backend::{Record, StorageBackend};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryBackend;
pub use queue_store::{
    DurableQueueStore, InstanceHeartbeat, OperationRecord, INSTANCES_TABLE, OPERATIONS_TABLE,
    OWNER_INDEX, SESSION_TABLE,
};
pub use sqlite::SqliteBackend;
