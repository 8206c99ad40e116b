//! The in-memory queue and its write-through to the durable store.

use crate::policy::{FailureClass, RetryDecision, RetryPolicy};
use crate::{OutboxError, OutboxResult};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use sync_core::{
    InstanceId, Operation, OperationDescriptor, OperationId, OperationState, RetryConfig,
    SyncEvent, SyncEventSink,
};
use sync_durable_store::DurableQueueStore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type OrderKey = (i64, u64, OperationId);

fn order_key(op: &Operation) -> OrderKey {
    let (created_ms, sequence) = op.order_key();
    (created_ms, sequence, op.id.clone())
}

#[derive(Debug)]
struct Entry {
    op: Operation,
    state: OperationState,
    /// Previous owner when the entry came from storage and was never
    /// claimed by this instance.
    recovered_from: Option<InstanceId>,
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<OperationId, Entry>,
    order: BTreeSet<OrderKey>,
    /// Dependencies not held here whose records are still in the durable
    /// store, typically held by another instance.
    external: HashSet<OperationId>,
    next_sequence: u64,
    accepting: bool,
}

impl QueueState {
    fn insert(&mut self, entry: Entry) {
        self.next_sequence = self.next_sequence.max(entry.op.sequence + 1);
        self.order.insert(order_key(&entry.op));
        self.entries.insert(entry.op.id.clone(), entry);
    }

    fn remove(&mut self, id: &OperationId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&order_key(&entry.op));
        Some(entry)
    }

    fn is_blocked(&self, op: &Operation) -> bool {
        op.depends
            .iter()
            .any(|dep| self.entries.contains_key(dep) || self.external.contains(dep))
    }

    /// Dependencies of `ops` that are neither held nor tracked, excluding
    /// ids in `batch`.
    fn untracked_dependencies<'a>(
        &self,
        ops: impl IntoIterator<Item = &'a Operation>,
        batch: &HashSet<&OperationId>,
    ) -> Vec<OperationId> {
        let mut seen = HashSet::new();
        ops.into_iter()
            .flat_map(|op| op.depends.iter())
            .filter(|dep| {
                !self.entries.contains_key(*dep)
                    && !self.external.contains(*dep)
                    && !batch.contains(*dep)
            })
            .filter(|dep| seen.insert((*dep).clone()))
            .cloned()
            .collect()
    }

    fn is_due(entry: &Entry, now: Instant) -> bool {
        match entry.state {
            OperationState::Created => true,
            OperationState::Retrying => entry.not_before.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// `root` and every queued operation that transitively depends on it,
    /// in queue order.
    fn with_dependents(&self, root: &OperationId) -> Vec<OperationId> {
        let mut doomed: HashSet<OperationId> = HashSet::from([root.clone()]);
        loop {
            let before = doomed.len();
            for entry in self.entries.values() {
                if entry.op.depends.iter().any(|dep| doomed.contains(dep)) {
                    doomed.insert(entry.op.id.clone());
                }
            }
            if doomed.len() == before {
                break;
            }
        }
        let mut ordered = vec![root.clone()];
        ordered.extend(
            self.order
                .iter()
                .map(|(_, _, id)| id)
                .filter(|id| *id != root && doomed.contains(*id))
                .cloned(),
        );
        ordered
    }
}

/// Counters describing the queue right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total: usize,
    /// Eligible now if the transport allows.
    pub ready: usize,
    /// Waiting for a dependency.
    pub blocked: usize,
    pub in_flight: usize,
    pub retrying: usize,
    /// Loaded from storage and not yet claimed.
    pub unclaimed: usize,
    pub accepting: bool,
    pub durable: bool,
}

enum FailureStep {
    Retry(Operation),
    Requeue(Operation),
    Abort(String),
}

/// Dependency-ordered operation queue for one instance.
pub struct SyncQueue {
    store: Arc<DurableQueueStore>,
    sink: Arc<dyn SyncEventSink>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

impl SyncQueue {
    /// Create a closed queue. Call [`SyncQueue::recover`] before submitting.
    pub fn new(
        store: Arc<DurableQueueStore>,
        sink: Arc<dyn SyncEventSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            sink,
            policy: RetryPolicy::new(retry),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.store.instance_id()
    }

    /// Load persisted work for this instance and open for submissions.
    ///
    /// Returns the number of operations recovered.
    pub async fn recover(&self) -> usize {
        let pending = self.store.load_pending().await;
        let recovered = self.insert_recovered(pending).await;
        self.state.lock().expect("lock poisoned").accepting = true;
        if recovered > 0 {
            info!(
                instance = %self.instance_id(),
                count = recovered,
                "Recovered persisted operations"
            );
        }
        recovered
    }

    /// Pick up records left behind by instances that stopped heartbeating.
    pub async fn adopt_orphans(&self) -> usize {
        if !self.state.lock().expect("lock poisoned").accepting {
            return 0;
        }
        let orphans = self.store.load_orphans().await;
        let adopted = self.insert_recovered(orphans).await;
        if adopted > 0 {
            info!(instance = %self.instance_id(), count = adopted, "Adopted orphaned operations");
        }
        adopted
    }

    async fn insert_recovered(&self, ops: Vec<Operation>) -> usize {
        let untracked = {
            let state = self.state.lock().expect("lock poisoned");
            let batch: HashSet<&OperationId> = ops.iter().map(|op| &op.id).collect();
            state.untracked_dependencies(&ops, &batch)
        };
        self.track_external(untracked).await;

        let mut state = self.state.lock().expect("lock poisoned");
        let mut inserted = 0;
        for op in ops {
            if state.entries.contains_key(&op.id) {
                continue;
            }
            state.external.remove(&op.id);
            let previous_owner = op.owner_instance_id.clone();
            state.insert(Entry {
                op,
                state: OperationState::Created,
                recovered_from: Some(previous_owner),
                not_before: None,
            });
            inserted += 1;
        }
        inserted
    }

    /// Block on each of `ids` that still has a durable record.
    async fn track_external(&self, ids: Vec<OperationId>) {
        if ids.is_empty() {
            return;
        }
        let stored = self.store.pending_ids(&ids).await;
        let mut state = self.state.lock().expect("lock poisoned");
        for id in stored {
            if !state.entries.contains_key(&id) && state.external.insert(id.clone()) {
                debug!(dependency = %id, "Waiting on dependency held elsewhere");
            }
        }
    }

    /// Release tracked dependencies whose records are gone.
    async fn refresh_external(&self) {
        let tracked: Vec<OperationId> = {
            let state = self.state.lock().expect("lock poisoned");
            state.external.iter().cloned().collect()
        };
        if tracked.is_empty() {
            return;
        }
        let stored = self.store.pending_ids(&tracked).await;
        let mut state = self.state.lock().expect("lock poisoned");
        for id in tracked {
            if !stored.contains(&id) && state.external.remove(&id) {
                debug!(dependency = %id, "Dependency settled elsewhere");
            }
        }
    }

    /// Submit a new operation under a fresh id.
    pub async fn enqueue(&self, descriptor: OperationDescriptor) -> OutboxResult<Operation> {
        self.enqueue_as(OperationId::new(), descriptor).await
    }

    /// Submit a new operation under a caller-chosen id.
    pub async fn enqueue_as(
        &self,
        id: OperationId,
        descriptor: OperationDescriptor,
    ) -> OutboxResult<Operation> {
        let (op, untracked) = {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.accepting {
                return Err(OutboxError::RecoveryPending);
            }
            if state.entries.contains_key(&id) {
                return Err(OutboxError::DuplicateOperation(id));
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let mut op = Operation::from_descriptor(
                descriptor,
                self.instance_id().clone(),
                Utc::now(),
                sequence,
            );
            op.id = id;
            let untracked = state.untracked_dependencies([&op], &HashSet::new());
            (op, untracked)
        };

        self.track_external(untracked).await;
        self.store.append(&op).await;
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.accepting {
                return Err(OutboxError::ShutDown);
            }
            state.insert(Entry {
                op: op.clone(),
                state: OperationState::Created,
                recovered_from: None,
                not_before: None,
            });
        }
        self.store.commit(&op).await;

        debug!(
            operation_id = %op.id,
            sequence = op.sequence,
            depends = op.depends.len(),
            "Enqueued operation"
        );
        Ok(op)
    }

    /// Take the earliest operation that may be dispatched now.
    ///
    /// `can_send` reports whether the operation's transport is available.
    /// Every operation is claimed from its durable holder first, so a record
    /// another instance picked up is never sent twice. A lost claim drops
    /// the entry, its dependents keep waiting on the winner, and selection
    /// moves on. While in flight the record is stored uncommitted.
    pub async fn dequeue_next<F>(&self, now: Instant, can_send: F) -> Option<Operation>
    where
        F: Fn(&Operation) -> bool,
    {
        self.refresh_external().await;

        loop {
            let (op, holder) = {
                let mut guard = self.state.lock().expect("lock poisoned");
                let state = &mut *guard;
                let id = state
                    .order
                    .iter()
                    .map(|(_, _, id)| id)
                    .find(|id| {
                        state.entries.get(*id).is_some_and(|entry| {
                            QueueState::is_due(entry, now)
                                && !state.is_blocked(&entry.op)
                                && can_send(&entry.op)
                        })
                    })?
                    .clone();
                let entry = state.entries.get_mut(&id)?;
                entry.not_before = None;
                entry.state = OperationState::Claimed;
                let holder = entry
                    .recovered_from
                    .clone()
                    .unwrap_or_else(|| entry.op.owner_instance_id.clone());
                (entry.op.clone(), holder)
            };

            if !self.store.claim(&op.id, &holder).await {
                let mut state = self.state.lock().expect("lock poisoned");
                state.remove(&op.id);
                state.external.insert(op.id.clone());
                debug!(
                    operation_id = %op.id,
                    holder = %holder,
                    "Claim lost to another instance"
                );
                continue;
            }

            let mut owned = op;
            owned.owner_instance_id = self.instance_id().clone();
            self.store.append(&owned).await;

            let mut state = self.state.lock().expect("lock poisoned");
            match state.entries.get_mut(&owned.id) {
                Some(entry) => {
                    entry.op = owned.clone();
                    if entry.recovered_from.take().is_some() {
                        debug!(
                            operation_id = %owned.id,
                            previous_owner = %holder,
                            "Claimed operation"
                        );
                    }
                    entry.state = OperationState::Dispatching;
                    return Some(owned);
                }
                // Shut down while claiming; the re-owned record stays durable.
                None => return None,
            }
        }
    }

    /// Record a successful dispatch.
    pub async fn on_resolved(&self, id: &OperationId, result: serde_json::Value) -> bool {
        let removed = self.state.lock().expect("lock poisoned").remove(id);
        if removed.is_none() {
            return false;
        }
        self.store.remove(id).await;
        info!(operation_id = %id, "Operation resolved");
        self.sink.emit(SyncEvent::OperationResolved {
            id: id.clone(),
            result,
        });
        true
    }

    /// Record a failed dispatch and apply the retry policy.
    pub async fn on_failed(&self, id: &OperationId, class: FailureClass, cause: &str) {
        let step = {
            let mut state = self.state.lock().expect("lock poisoned");
            let Some(entry) = state.entries.get_mut(id) else {
                return;
            };
            match class {
                FailureClass::Transient => {
                    entry.op.retry_count += 1;
                    match self.policy.decide(entry.op.retry_count) {
                        RetryDecision::RetryAfter(delay) => {
                            entry.state = OperationState::Retrying;
                            entry.not_before = Some(Instant::now() + delay);
                            warn!(
                                operation_id = %id,
                                retry = entry.op.retry_count,
                                delay_ms = delay.as_millis() as u64,
                                cause,
                                "Transient failure, will retry"
                            );
                            FailureStep::Retry(entry.op.clone())
                        }
                        RetryDecision::GiveUp => FailureStep::Abort(format!(
                            "retry bound exceeded after {} attempts: {cause}",
                            entry.op.retry_count
                        )),
                    }
                }
                FailureClass::AuthExpired | FailureClass::Deferred => {
                    entry.state = OperationState::Created;
                    entry.not_before = None;
                    debug!(operation_id = %id, ?class, cause, "Operation requeued");
                    FailureStep::Requeue(entry.op.clone())
                }
                FailureClass::Permanent => FailureStep::Abort(cause.to_string()),
            }
        };

        match step {
            FailureStep::Retry(op) | FailureStep::Requeue(op) => self.store.commit(&op).await,
            FailureStep::Abort(reason) => self.abort(id, &reason).await,
        }
    }

    async fn abort(&self, id: &OperationId, reason: &str) {
        let doomed = {
            let mut state = self.state.lock().expect("lock poisoned");
            let ids = state.with_dependents(id);
            for doomed in &ids {
                state.remove(doomed);
            }
            ids
        };

        for doomed in &doomed {
            self.store.remove(doomed).await;
            let error = if doomed == id {
                reason.to_string()
            } else {
                format!("dependency failed: {id}")
            };
            warn!(operation_id = %doomed, error = %error, "Operation aborted");
            self.sink.emit(SyncEvent::OperationFailed {
                id: doomed.clone(),
                error,
                permanent: true,
            });
        }
    }

    /// Close for submissions and forget in-memory state. Durable records are
    /// kept for the next instance. Returns the ids that were held.
    pub fn shutdown(&self) -> Vec<OperationId> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.accepting = false;
        let held: Vec<OperationId> = state.order.iter().map(|(_, _, id)| id.clone()).collect();
        state.entries.clear();
        state.order.clear();
        state.external.clear();
        held
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .entries
            .contains_key(id)
    }

    pub fn state_of(&self, id: &OperationId) -> Option<OperationState> {
        self.state
            .lock()
            .expect("lock poisoned")
            .entries
            .get(id)
            .map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest backoff deadline among retrying operations.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .expect("lock poisoned")
            .entries
            .values()
            .filter(|entry| entry.state == OperationState::Retrying)
            .filter_map(|entry| entry.not_before)
            .min()
    }

    pub fn status(&self) -> QueueStatus {
        let now = Instant::now();
        let state = self.state.lock().expect("lock poisoned");
        let mut status = QueueStatus {
            total: state.entries.len(),
            accepting: state.accepting,
            durable: self.store.is_durable(),
            ..QueueStatus::default()
        };
        for entry in state.entries.values() {
            if entry.recovered_from.is_some() {
                status.unclaimed += 1;
            }
            match entry.state {
                OperationState::Dispatching => status.in_flight += 1,
                OperationState::Retrying => status.retrying += 1,
                _ => {}
            }
            if state.is_blocked(&entry.op) {
                status.blocked += 1;
            } else if QueueState::is_due(entry, now) {
                status.ready += 1;
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sync_core::{HttpMethod, OperationKind, RecordingSink};
    use sync_durable_store::{MemoryBackend, StorageBackend, OPERATIONS_TABLE};

    fn retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay_ms: 60_000,
            max_delay_ms: 120_000,
        }
    }

    fn store_on(backend: &Arc<MemoryBackend>, id: &str) -> Arc<DurableQueueStore> {
        let backend: Arc<dyn StorageBackend> = backend.clone();
        Arc::new(DurableQueueStore::new(
            Some(backend),
            InstanceId::from_string(id),
            Duration::from_secs(30),
        ))
    }

    async fn open_queue(store: Arc<DurableQueueStore>) -> (SyncQueue, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let queue = SyncQueue::new(store, sink.clone(), retry());
        queue.recover().await;
        (queue, sink)
    }

    fn create(path: &str) -> OperationDescriptor {
        OperationDescriptor::request(OperationKind::Create, HttpMethod::Post, path)
    }

    fn always(_: &Operation) -> bool {
        true
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[tokio::test]
    async fn enqueue_is_rejected_until_recovered() {
        let store = Arc::new(DurableQueueStore::memory_only(InstanceId::new()));
        let queue = SyncQueue::new(store, Arc::new(RecordingSink::new()), retry());
        assert_eq!(
            queue.enqueue(create("/a")).await.unwrap_err(),
            OutboxError::RecoveryPending
        );
        queue.recover().await;
        assert!(queue.enqueue(create("/a")).await.is_ok());
    }

    #[tokio::test]
    async fn dependent_waits_for_dependency() {
        let store = Arc::new(DurableQueueStore::memory_only(InstanceId::new()));
        let (queue, sink) = open_queue(store).await;
        let parent = queue.enqueue(create("/conversations")).await.unwrap();
        let child = queue
            .enqueue(create("/messages").depends_on(parent.id.clone()))
            .await
            .unwrap();

        let first = queue.dequeue_next(Instant::now(), always).await.unwrap();
        assert_eq!(first.id, parent.id);
        assert!(queue.dequeue_next(Instant::now(), always).await.is_none());
        assert_eq!(queue.status().blocked, 1);

        assert!(queue.on_resolved(&parent.id, serde_json::json!({"ok": true})).await);
        let second = queue.dequeue_next(Instant::now(), always).await.unwrap();
        assert_eq!(second.id, child.id);
        assert_eq!(sink.resolved_ids(), vec![parent.id]);
    }

    #[tokio::test]
    async fn unrelated_operations_dispatch_concurrently_in_order() {
        let store = Arc::new(DurableQueueStore::memory_only(InstanceId::new()));
        let (queue, _) = open_queue(store).await;
        let a = queue.enqueue(create("/a")).await.unwrap();
        let b = queue.enqueue(create("/b")).await.unwrap();

        assert_eq!(queue.dequeue_next(Instant::now(), always).await.unwrap().id, a.id);
        assert_eq!(queue.dequeue_next(Instant::now(), always).await.unwrap().id, b.id);
        assert_eq!(queue.status().in_flight, 2);
    }

    #[tokio::test]
    async fn unavailable_transport_only_blocks_its_own_operations() {
        let store = Arc::new(DurableQueueStore::memory_only(InstanceId::new()));
        let (queue, _) = open_queue(store).await;
        let channel_op = queue
            .enqueue(create("/typing").over(sync_core::TransportKind::PersistentChannel))
            .await
            .unwrap();
        let http_op = queue.enqueue(create("/a")).await.unwrap();

        let http_only =
            |op: &Operation| op.transport == sync_core::TransportKind::RequestResponse;
        let picked = queue.dequeue_next(Instant::now(), http_only).await.unwrap();
        assert_eq!(picked.id, http_op.id);
        assert_eq!(queue.state_of(&channel_op.id), Some(OperationState::Created));
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_persists_retry_count() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, "tab-1");
        let (queue, _) = open_queue(store.clone()).await;
        let op = queue.enqueue(create("/a")).await.unwrap();
        queue.dequeue_next(Instant::now(), always).await.unwrap();

        queue.on_failed(&op.id, FailureClass::Transient, "503").await;
        assert_eq!(queue.state_of(&op.id), Some(OperationState::Retrying));
        assert!(queue.next_deadline().is_some());
        assert!(queue.dequeue_next(Instant::now(), always).await.is_none());

        let retried = queue.dequeue_next(later(), always).await.unwrap();
        assert_eq!(retried.retry_count, 1);

        let persisted = store.load_pending().await;
        assert_eq!(persisted[0].retry_count, 1);
    }

    #[tokio::test]
    async fn retry_bound_turns_transient_into_permanent() {
        let store = Arc::new(DurableQueueStore::memory_only(InstanceId::new()));
        let (queue, sink) = open_queue(store).await;
        let op = queue.enqueue(create("/a")).await.unwrap();

        for _ in 0..3 {
            queue.dequeue_next(later(), always).await.unwrap();
            queue.on_failed(&op.id, FailureClass::Transient, "offline").await;
        }

        assert!(!queue.contains(&op.id));
        match sink.events().last().unwrap() {
            SyncEvent::OperationFailed {
                id,
                error,
                permanent,
            } => {
                assert_eq!(id, &op.id);
                assert!(*permanent);
                assert!(error.contains("retry bound exceeded"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_expired_requeues_without_consuming_retry() {
        let store = Arc::new(DurableQueueStore::memory_only(InstanceId::new()));
        let (queue, _) = open_queue(store).await;
        let op = queue.enqueue(create("/a")).await.unwrap();
        queue.dequeue_next(Instant::now(), always).await.unwrap();

        queue.on_failed(&op.id, FailureClass::AuthExpired, "401").await;
        assert_eq!(queue.state_of(&op.id), Some(OperationState::Created));

        let again = queue.dequeue_next(Instant::now(), always).await.unwrap();
        assert_eq!(again.retry_count, 0);
    }

    #[tokio::test]
    async fn permanent_failure_aborts_transitive_dependents() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, sink) = open_queue(store_on(&backend, "tab-1")).await;
        let a = queue.enqueue(create("/a")).await.unwrap();
        let b = queue.enqueue(create("/b").depends_on(a.id.clone())).await.unwrap();
        let c = queue.enqueue(create("/c").depends_on(b.id.clone())).await.unwrap();
        let unrelated = queue.enqueue(create("/d")).await.unwrap();

        queue.dequeue_next(Instant::now(), always).await.unwrap();
        queue.on_failed(&a.id, FailureClass::Permanent, "404 not found").await;

        let failed: Vec<_> = sink
            .events()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::OperationFailed { id, error, .. } => Some((id.clone(), error.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 3);
        assert_eq!(failed[0], (a.id.clone(), "404 not found".to_string()));
        assert_eq!(failed[1].0, b.id);
        assert_eq!(failed[2].0, c.id);
        assert!(failed[2].1.starts_with("dependency failed"));

        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&unrelated.id));
        assert_eq!(backend.len(OPERATIONS_TABLE), 1);
    }

    #[tokio::test]
    async fn restart_reproduces_dispatch_order() {
        let backend = Arc::new(MemoryBackend::new());
        let ids = {
            let (queue, _) = open_queue(store_on(&backend, "tab-1")).await;
            let a = queue.enqueue(create("/a")).await.unwrap();
            let b = queue.enqueue(create("/b").depends_on(a.id.clone())).await.unwrap();
            let c = queue.enqueue(create("/c")).await.unwrap();
            queue.shutdown();
            vec![a.id, b.id, c.id]
        };
        assert_eq!(backend.len(OPERATIONS_TABLE), 3);

        let (queue, _) = open_queue(store_on(&backend, "tab-1")).await;
        assert_eq!(queue.status().unclaimed, 3);

        let mut dispatched = Vec::new();
        while let Some(op) = queue.dequeue_next(Instant::now(), always).await {
            dispatched.push(op.id.clone());
            queue.on_resolved(&op.id, serde_json::Value::Null).await;
        }
        assert_eq!(dispatched, ids);
        assert_eq!(backend.len(OPERATIONS_TABLE), 0);
    }

    #[tokio::test]
    async fn only_one_instance_wins_an_orphan() {
        let backend = Arc::new(MemoryBackend::new());
        let dead = store_on(&backend, "tab-dead");
        let (old_queue, _) = open_queue(dead).await;
        let orphan = old_queue.enqueue(create("/a")).await.unwrap();
        old_queue.shutdown();

        let (first, _) = open_queue(store_on(&backend, "tab-1")).await;
        let (second, _) = open_queue(store_on(&backend, "tab-2")).await;
        assert!(first.contains(&orphan.id));
        assert!(second.contains(&orphan.id));

        let won_first = first.dequeue_next(Instant::now(), always).await;
        let won_second = second.dequeue_next(Instant::now(), always).await;

        let winner = won_first.expect("first claimant wins");
        assert!(won_second.is_none());
        assert!(!second.contains(&orphan.id));
        assert_eq!(winner.owner_instance_id, InstanceId::from_string("tab-1"));
    }

    #[tokio::test]
    async fn adopt_orphans_skips_held_operations() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _) = open_queue(store_on(&backend, "tab-1")).await;
        let dead = store_on(&backend, "tab-dead");
        let (dead_queue, _) = open_queue(dead).await;
        dead_queue.enqueue(create("/a")).await.unwrap();
        dead_queue.shutdown();

        assert_eq!(queue.adopt_orphans().await, 1);
        assert_eq!(queue.adopt_orphans().await, 0);
    }

    #[tokio::test]
    async fn dependency_held_by_another_instance_blocks() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _) = open_queue(store_on(&backend, "tab-1")).await;
        let (peer, _) = open_queue(store_on(&backend, "tab-2")).await;

        let parent = peer.enqueue(create("/conversations")).await.unwrap();
        let child = queue
            .enqueue(create("/messages").depends_on(parent.id.clone()))
            .await
            .unwrap();
        assert!(queue.dequeue_next(Instant::now(), always).await.is_none());
        assert_eq!(queue.status().blocked, 1);

        let sent = peer.dequeue_next(Instant::now(), always).await.unwrap();
        assert!(peer.on_resolved(&sent.id, serde_json::Value::Null).await);

        let next = queue.dequeue_next(Instant::now(), always).await.unwrap();
        assert_eq!(next.id, child.id);
    }

    #[tokio::test]
    async fn lost_claim_keeps_local_dependents_waiting() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _) = open_queue(store_on(&backend, "tab-1")).await;
        let parent = queue.enqueue(create("/conversations")).await.unwrap();
        let child = queue
            .enqueue(create("/messages").depends_on(parent.id.clone()))
            .await
            .unwrap();

        // Another instance claims the parent first.
        let peer = store_on(&backend, "tab-2");
        assert!(peer.claim(&parent.id, queue.instance_id()).await);
        let mut taken = parent.clone();
        taken.owner_instance_id = peer.instance_id().clone();
        peer.commit(&taken).await;

        assert!(queue.dequeue_next(Instant::now(), always).await.is_none());
        assert!(!queue.contains(&parent.id));
        assert_eq!(queue.state_of(&child.id), Some(OperationState::Created));
        assert_eq!(queue.status().blocked, 1);

        peer.remove(&parent.id).await;
        let next = queue.dequeue_next(Instant::now(), always).await.unwrap();
        assert_eq!(next.id, child.id);
    }

    #[tokio::test]
    async fn in_flight_record_is_left_to_its_sender() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_on(&backend, "tab-1");
        store.heartbeat().await;
        let (queue, _) = open_queue(store).await;
        let queued = queue.enqueue(create("/a")).await.unwrap();
        let in_flight = queue.enqueue(create("/b")).await.unwrap();

        let (starting, _) = open_queue(store_on(&backend, "tab-2")).await;
        assert!(starting.contains(&queued.id));
        assert!(starting.contains(&in_flight.id));
        starting.shutdown();

        queue.dequeue_next(Instant::now(), always).await.unwrap();
        queue.dequeue_next(Instant::now(), always).await.unwrap();
        queue.on_failed(&queued.id, FailureClass::Deferred, "channel closed").await;

        let (later, _) = open_queue(store_on(&backend, "tab-3")).await;
        assert!(later.contains(&queued.id));
        assert!(!later.contains(&in_flight.id));
    }

    #[tokio::test]
    async fn shutdown_keeps_durable_records() {
        let backend = Arc::new(MemoryBackend::new());
        let (queue, _) = open_queue(store_on(&backend, "tab-1")).await;
        let op = queue.enqueue(create("/a")).await.unwrap();

        let held = queue.shutdown();
        assert_eq!(held, vec![op.id]);
        assert!(queue.is_empty());
        assert_eq!(backend.len(OPERATIONS_TABLE), 1);
        assert_eq!(
            queue.enqueue(create("/b")).await.unwrap_err(),
            OutboxError::RecoveryPending
        );
    }
}
