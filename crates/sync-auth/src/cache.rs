//! Session cache kept in the durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sync_durable_store::{DurableQueueStore, Record, SESSION_TABLE};
use tracing::warn;

const SESSION_KEY: &str = "current";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSession {
    pub user_id: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedSession {
    /// Usable for `user_id` at `now`.
    pub fn is_valid_for(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.user_id == user_id && self.expires_at > now
    }
}

/// Single-slot session cache. Without durable storage it never holds
/// anything.
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<DurableQueueStore>,
}

impl SessionCache {
    pub fn new(store: Arc<DurableQueueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Option<CachedSession> {
        let record = self
            .store
            .load_by_keys(SESSION_TABLE, &[SESSION_KEY.to_string()])
            .await
            .into_iter()
            .next()?;
        match serde_json::from_value(record.body) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cached session");
                None
            }
        }
    }

    pub async fn save(&self, session: &CachedSession) {
        match serde_json::to_value(session) {
            Ok(body) => {
                self.store
                    .put_record(SESSION_TABLE, Record::new(SESSION_KEY, body))
                    .await
            }
            Err(e) => warn!(error = %e, "Failed to serialize session for cache"),
        }
    }

    pub async fn clear(&self) {
        self.store
            .delete_records(SESSION_TABLE, &[SESSION_KEY.to_string()])
            .await;
    }
}
