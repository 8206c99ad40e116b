//! Operation ledger shared by all instances on a device.
//!
//! Every method swallows storage failures: the first one is logged and the
//! store switches to memory-only for the rest of its life. Callers never see
//! a storage error and never need to branch on durability.

use crate::{Record, StorageBackend, StoreResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{InstanceId, Operation, OperationId};
use tracing::{debug, warn};

pub const OPERATIONS_TABLE: &str = "sync_operations";
pub const INSTANCES_TABLE: &str = "sync_instances";
pub const SESSION_TABLE: &str = "sync_session";
/// Body field the operations table is indexed by.
pub const OWNER_INDEX: &str = "owner_instance_id";

/// Persisted form of an operation.
///
/// `committed` is false between the first write and the in-memory insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default)]
    pub committed: bool,
}

/// Liveness marker written periodically by each instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub instance_id: InstanceId,
    pub last_seen_ms: i64,
}

pub struct DurableQueueStore {
    backend: Option<Arc<dyn StorageBackend>>,
    instance_id: InstanceId,
    orphan_after: Duration,
    degraded: AtomicBool,
}

impl DurableQueueStore {
    /// `backend = None` gives a memory-only store.
    pub fn new(
        backend: Option<Arc<dyn StorageBackend>>,
        instance_id: InstanceId,
        orphan_after: Duration,
    ) -> Self {
        if backend.is_none() {
            debug!(instance = %instance_id, "No storage backend; running memory-only");
        }
        Self {
            backend,
            instance_id,
            orphan_after,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn memory_only(instance_id: InstanceId) -> Self {
        Self::new(None, instance_id, Duration::from_secs(30))
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// True while writes still reach persistent storage.
    pub fn is_durable(&self) -> bool {
        self.backend().is_some()
    }

    fn backend(&self) -> Option<&Arc<dyn StorageBackend>> {
        if self.degraded.load(Ordering::SeqCst) {
            None
        } else {
            self.backend.as_ref()
        }
    }

    /// Unwrap a storage result, degrading the store on failure.
    fn absorb<T>(&self, what: &str, result: StoreResult<T>, fallback: T) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(
                        instance = %self.instance_id,
                        operation = what,
                        error = %e,
                        "Durable store failed; continuing memory-only"
                    );
                }
                fallback
            }
        }
    }

    async fn write(&self, what: &str, op: &Operation, committed: bool) {
        let Some(backend) = self.backend() else {
            return;
        };
        let record = OperationRecord {
            operation: op.clone(),
            committed,
        };
        let result = match serde_json::to_value(&record) {
            Ok(body) => {
                backend
                    .put(OPERATIONS_TABLE, Record::new(op.id.as_str(), body))
                    .await
            }
            Err(e) => Err(e.into()),
        };
        self.absorb(what, result, ());
    }

    /// First durable write of an operation, before it is visible in memory.
    pub async fn append(&self, op: &Operation) {
        self.write("append", op, false).await;
    }

    /// Rewrite the operation as committed. Also used for later updates such
    /// as a bumped retry count or a new owner.
    pub async fn commit(&self, op: &Operation) {
        self.write("commit", op, true).await;
    }

    /// Atomically take `op_id` from `expected_owner`.
    ///
    /// On success the record is gone from storage and the caller must write
    /// it back under its own ownership. Without durable storage every claim
    /// succeeds.
    pub async fn claim(&self, op_id: &OperationId, expected_owner: &InstanceId) -> bool {
        let Some(backend) = self.backend() else {
            return true;
        };
        let result = backend
            .take_if(
                OPERATIONS_TABLE,
                op_id.as_str(),
                OWNER_INDEX,
                expected_owner.as_str(),
            )
            .await
            .map(|taken| taken.is_some());
        self.absorb("claim", result, true)
    }

    pub async fn remove(&self, op_id: &OperationId) {
        if let Some(backend) = self.backend() {
            let result = backend
                .delete(OPERATIONS_TABLE, &[op_id.as_str().to_string()])
                .await
                .map(|_| ());
            self.absorb("remove", result, ());
        }
    }

    /// Operations this instance should hold in memory after a restart.
    ///
    /// Everything in the ledger except records a different live instance
    /// has not committed: those are either mid-append or in flight and stay
    /// with their writer. Everything else still has to be claimed before
    /// dispatch. The result is in durable order.
    pub async fn load_pending(&self) -> Vec<Operation> {
        let Some(backend) = self.backend() else {
            return Vec::new();
        };
        let owned = backend
            .scan_by_index(OPERATIONS_TABLE, OWNER_INDEX, self.instance_id.as_str())
            .await;
        let owned = self.absorb("load_pending", owned, Vec::new());
        let mut pending = self.decode_all(owned);

        let live = self.live_instances().await;
        let all = backend.scan_all(OPERATIONS_TABLE).await;
        let all = self.absorb("load_pending", all, Vec::new());
        pending.extend(
            self.decode_records(all)
                .into_iter()
                .filter(|record| {
                    let owner = &record.operation.owner_instance_id;
                    *owner != self.instance_id && (record.committed || !live.contains(owner))
                })
                .map(|record| record.operation),
        );
        pending.sort_by_key(Operation::order_key);
        pending.dedup_by(|a, b| a.id == b.id);
        pending
    }

    /// Records owned by instances whose heartbeat has lapsed.
    pub async fn load_orphans(&self) -> Vec<Operation> {
        let Some(backend) = self.backend() else {
            return Vec::new();
        };
        let live = self.live_instances().await;
        let all = backend.scan_all(OPERATIONS_TABLE).await;
        let all = self.absorb("load_orphans", all, Vec::new());
        let mut orphans: Vec<Operation> = self
            .decode_all(all)
            .into_iter()
            .filter(|op| !live.contains(&op.owner_instance_id))
            .collect();
        orphans.sort_by_key(Operation::order_key);
        orphans
    }

    /// The subset of `ids` that still has a record, whoever owns it.
    pub async fn pending_ids(&self, ids: &[OperationId]) -> HashSet<OperationId> {
        if ids.is_empty() {
            return HashSet::new();
        }
        let keys: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.load_by_keys(OPERATIONS_TABLE, &keys)
            .await
            .into_iter()
            .map(|record| OperationId::from_string(record.key))
            .collect()
    }

    fn decode_all(&self, records: Vec<Record>) -> Vec<Operation> {
        self.decode_records(records)
            .into_iter()
            .map(|record| record.operation)
            .collect()
    }

    fn decode_records(&self, records: Vec<Record>) -> Vec<OperationRecord> {
        records
            .into_iter()
            .filter_map(
                |record| match serde_json::from_value::<OperationRecord>(record.body) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!(
                            key = %record.key,
                            error = %e,
                            "Skipping unreadable operation record"
                        );
                        None
                    }
                },
            )
            .collect()
    }

    /// Record this instance as alive now.
    pub async fn heartbeat(&self) {
        let Some(backend) = self.backend() else {
            return;
        };
        let beat = InstanceHeartbeat {
            instance_id: self.instance_id.clone(),
            last_seen_ms: Utc::now().timestamp_millis(),
        };
        let result = match serde_json::to_value(&beat) {
            Ok(body) => {
                backend
                    .put(INSTANCES_TABLE, Record::new(self.instance_id.as_str(), body))
                    .await
            }
            Err(e) => Err(e.into()),
        };
        self.absorb("heartbeat", result, ());
    }

    /// Drop this instance's heartbeat so others may adopt its records at once.
    pub async fn deregister(&self) {
        if let Some(backend) = self.backend() {
            let result = backend
                .delete(INSTANCES_TABLE, &[self.instance_id.as_str().to_string()])
                .await
                .map(|_| ());
            self.absorb("deregister", result, ());
        }
    }

    /// Instances with a fresh heartbeat. Always contains this instance.
    pub async fn live_instances(&self) -> HashSet<InstanceId> {
        let mut live = HashSet::from([self.instance_id.clone()]);
        let Some(backend) = self.backend() else {
            return live;
        };
        let beats = backend.scan_all(INSTANCES_TABLE).await;
        let beats = self.absorb("live_instances", beats, Vec::new());
        let cutoff = Utc::now().timestamp_millis() - self.orphan_after.as_millis() as i64;
        for record in beats {
            match serde_json::from_value::<InstanceHeartbeat>(record.body) {
                Ok(beat) if beat.last_seen_ms >= cutoff => {
                    live.insert(beat.instance_id);
                }
                Ok(_) => {}
                Err(e) => warn!(key = %record.key, error = %e, "Skipping unreadable heartbeat"),
            }
        }
        live
    }

    /// Read records of an arbitrary table.
    pub async fn load_by_keys(&self, table: &str, keys: &[String]) -> Vec<Record> {
        match self.backend() {
            Some(backend) => {
                let result = backend.get(table, keys).await;
                self.absorb("load_by_keys", result, Vec::new())
            }
            None => Vec::new(),
        }
    }

    pub async fn put_record(&self, table: &str, record: Record) {
        if let Some(backend) = self.backend() {
            let result = backend.put(table, record).await;
            self.absorb("put_record", result, ());
        }
    }

    pub async fn delete_records(&self, table: &str, keys: &[String]) {
        if let Some(backend) = self.backend() {
            let result = backend.delete(table, keys).await.map(|_| ());
            self.absorb("delete_records", result, ());
        }
    }

    /// Empty each named table.
    pub async fn clear_tables(&self, tables: &[String]) {
        for table in tables {
            let Some(backend) = self.backend() else {
                return;
            };
            let result = backend.clear(table).await.map(|_| ());
            self.absorb("clear_tables", result, ());
        }
    }
}
