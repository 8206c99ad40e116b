//! Core types, configuration, and utilities for the offline sync core.
//!
//! Every other crate in the workspace builds on these:
//! - [`Operation`] and friends: the unit of work the queue owns
//! - [`SyncEvent`] / [`SyncEventSink`]: what the core reports upstream
//! - [`SyncConfig`]: retry, timing and endpoint configuration
//! - [`init_logging`]: tracing subscriber setup

mod config;
mod error;
pub mod events;
mod logging;
pub mod types;

pub use config::{
    default_database_path, GatewayRetryConfig, RetryConfig, SyncConfig, DEFAULT_LOG_LEVEL,
    DEFAULT_SERVICE_URL,
};
pub use error::{CoreError, CoreResult};
pub use events::{NullSink, RecordingSink, SyncEvent, SyncEventSink};
pub use logging::{init_logging, parse_level};
pub use types::{
    HttpMethod, InstanceId, Operation, OperationDescriptor, OperationId, OperationKind,
    OperationState, TransportKind,
};
