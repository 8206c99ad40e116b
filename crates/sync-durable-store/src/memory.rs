//! In-process storage backend.

use crate::backend::{validate_field, Record, StorageBackend};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Table = BTreeMap<String, serde_json::Value>;

/// [`StorageBackend`] kept in memory.
///
/// Share one `Arc<MemoryBackend>` between several stores to model instances
/// on the same device. [`MemoryBackend::set_available`] makes every call
/// fail until switched back on.
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Table>>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of records in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .expect("lock poisoned")
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory backend switched off".to_string(),
            ))
        }
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&mut Table) -> T) -> StoreResult<T> {
        self.check()?;
        let mut tables = self.tables.lock().expect("lock poisoned");
        Ok(f(tables.entry(table.to_string()).or_default()))
    }
}

fn field_matches(body: &serde_json::Value, field: &str, expected: &str) -> bool {
    body.get(field).and_then(serde_json::Value::as_str) == Some(expected)
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, table: &str, record: Record) -> StoreResult<()> {
        self.with_table(table, |t| {
            t.insert(record.key, record.body);
        })
    }

    async fn get(&self, table: &str, keys: &[String]) -> StoreResult<Vec<Record>> {
        self.with_table(table, |t| {
            keys.iter()
                .filter_map(|key| t.get(key).map(|body| Record::new(key.clone(), body.clone())))
                .collect()
        })
    }

    async fn delete(&self, table: &str, keys: &[String]) -> StoreResult<usize> {
        self.with_table(table, |t| {
            keys.iter().filter(|key| t.remove(*key).is_some()).count()
        })
    }

    async fn scan_all(&self, table: &str) -> StoreResult<Vec<Record>> {
        self.with_table(table, |t| {
            t.iter()
                .map(|(key, body)| Record::new(key.clone(), body.clone()))
                .collect()
        })
    }

    async fn scan_by_index(
        &self,
        table: &str,
        index: &str,
        value: &str,
    ) -> StoreResult<Vec<Record>> {
        validate_field(index)?;
        self.with_table(table, |t| {
            t.iter()
                .filter(|(_, body)| field_matches(body, index, value))
                .map(|(key, body)| Record::new(key.clone(), body.clone()))
                .collect()
        })
    }

    async fn take_if(
        &self,
        table: &str,
        key: &str,
        field: &str,
        expected: &str,
    ) -> StoreResult<Option<Record>> {
        validate_field(field)?;
        self.with_table(table, |t| {
            let matches = t
                .get(key)
                .is_some_and(|body| field_matches(body, field, expected));
            if matches {
                t.remove(key).map(|body| Record::new(key, body))
            } else {
                None
            }
        })
    }

    async fn clear(&self, table: &str) -> StoreResult<usize> {
        self.with_table(table, |t| {
            let removed = t.len();
            t.clear();
            removed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.put("ops", Record::new("a", json!({}))).await.unwrap();

        backend.set_available(false);
        assert!(matches!(
            backend.scan_all("ops").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(backend.put("ops", Record::new("b", json!({}))).await.is_err());

        backend.set_available(true);
        assert_eq!(backend.len("ops"), 1);
    }

    #[tokio::test]
    async fn take_if_is_exclusive() {
        let backend = MemoryBackend::new();
        backend
            .put("ops", Record::new("a", json!({"owner_instance_id": "x"})))
            .await
            .unwrap();

        assert!(backend
            .take_if("ops", "a", "owner_instance_id", "y")
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .take_if("ops", "a", "owner_instance_id", "x")
            .await
            .unwrap()
            .is_some());
        assert!(backend
            .take_if("ops", "a", "owner_instance_id", "x")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_counts_only_existing_keys() {
        let backend = MemoryBackend::new();
        backend.put("ops", Record::new("a", json!({}))).await.unwrap();
        let removed = backend
            .delete("ops", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.len("ops"), 0);
    }
}
