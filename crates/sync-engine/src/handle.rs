//! Submission handles and the event sink that completes them.

use std::collections::HashMap;
use std::sync::Mutex;
use sync_core::{OperationId, SyncEvent, SyncEventSink};
use tokio::sync::{broadcast, oneshot};
use tracing::trace;

/// Final result of a submitted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Resolved(serde_json::Value),
    Failed { error: String, permanent: bool },
    /// The engine stopped first; the operation is still durably queued.
    Detached,
}

/// Returned by [`crate::SyncEngine::submit`].
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    rx: oneshot::Receiver<OperationOutcome>,
}

impl OperationHandle {
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub async fn wait(self) -> OperationOutcome {
        self.rx.await.unwrap_or(OperationOutcome::Detached)
    }
}

/// Completes waiting handles and fans every event out to subscribers.
pub(crate) struct EngineSink {
    waiters: Mutex<HashMap<OperationId, oneshot::Sender<OperationOutcome>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl EngineSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            waiters: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn register(&self, id: OperationId) -> OperationHandle {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("lock poisoned")
            .insert(id.clone(), tx);
        OperationHandle { id, rx }
    }

    pub(crate) fn forget(&self, id: &OperationId) {
        self.waiters.lock().expect("lock poisoned").remove(id);
    }

    /// Every outstanding handle resolves to [`OperationOutcome::Detached`].
    pub(crate) fn detach_all(&self) -> usize {
        let mut waiters = self.waiters.lock().expect("lock poisoned");
        let detached = waiters.len();
        waiters.clear();
        detached
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn complete(&self, id: &OperationId, outcome: OperationOutcome) {
        let waiter = self.waiters.lock().expect("lock poisoned").remove(id);
        if let Some(tx) = waiter {
            let _ = tx.send(outcome);
        }
    }
}

impl SyncEventSink for EngineSink {
    fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::OperationResolved { id, result } => {
                self.complete(id, OperationOutcome::Resolved(result.clone()))
            }
            SyncEvent::OperationFailed {
                id,
                error,
                permanent,
            } => self.complete(
                id,
                OperationOutcome::Failed {
                    error: error.clone(),
                    permanent: *permanent,
                },
            ),
            _ => {}
        }
        // No subscribers is fine.
        if self.events.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}
