//! Events the sync core reports to the entity layer.
//!
//! The queue and the session manager emit; the sink decides what they mean
//! (complete a caller's handle, fan out to UI listeners, or nothing at all).

use crate::types::OperationId;
use serde::{Deserialize, Serialize};

/// Something upstream may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// `operation:resolved`: the backend accepted the operation.
    OperationResolved {
        id: OperationId,
        result: serde_json::Value,
    },
    /// `operation:failed`: the operation left the queue without success.
    OperationFailed {
        id: OperationId,
        error: String,
        permanent: bool,
    },
    /// `session:ready`
    SessionReady { user_id: String },
    /// `session:deauthenticated`
    SessionDeauthenticated { reason: String },
    /// `connectivity:changed`
    ConnectivityChanged { is_online: bool },
}

impl SyncEvent {
    /// The operation this event is about, if any.
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            SyncEvent::OperationResolved { id, .. } | SyncEvent::OperationFailed { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }
}

/// Receives events from the queue and the session manager.
pub trait SyncEventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl SyncEventSink for NullSink {
    fn emit(&self, _event: SyncEvent) {}
}

/// Records every event; used by tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of resolved operations, in emission order.
    pub fn resolved_ids(&self) -> Vec<OperationId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::OperationResolved { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl SyncEventSink for RecordingSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}
