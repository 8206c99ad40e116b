//! Storage collaborator contract.

use crate::{StoreError, StoreResult};
use async_trait::async_trait;

/// One row of a named table: a primary key and a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub body: serde_json::Value,
}

impl Record {
    pub fn new(key: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }

    /// String value of a top-level field of the body.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Table-oriented persistent storage.
///
/// Every call is its own transactional scope. Index lookups match a
/// top-level string field of the record body. Scan order is unspecified.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert the record; on key conflict, replace the stored body.
    async fn put(&self, table: &str, record: Record) -> StoreResult<()>;

    /// Records for the given keys; missing keys are skipped.
    async fn get(&self, table: &str, keys: &[String]) -> StoreResult<Vec<Record>>;

    /// Returns how many records were removed.
    async fn delete(&self, table: &str, keys: &[String]) -> StoreResult<usize>;

    async fn scan_all(&self, table: &str) -> StoreResult<Vec<Record>>;

    async fn scan_by_index(&self, table: &str, index: &str, value: &str)
        -> StoreResult<Vec<Record>>;

    /// Atomically read and delete `key` if it still exists and its `field`
    /// equals `expected`. Exactly one of several racing callers gets `Some`.
    async fn take_if(
        &self,
        table: &str,
        key: &str,
        field: &str,
        expected: &str,
    ) -> StoreResult<Option<Record>>;

    /// Remove every record of the table.
    async fn clear(&self, table: &str) -> StoreResult<usize>;
}

/// Field names end up inside JSON paths; keep them to plain identifiers.
pub(crate) fn validate_field(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidData(format!("invalid field name: {name:?}")))
    }
}
