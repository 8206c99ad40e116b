//! SQLite storage backend.
//!
//! All statements run on the tokio-rusqlite executor thread. Several
//! processes may open the same file; WAL mode plus a busy timeout lets them
//! interleave, and [`SqliteBackend::take_if`] holds a write lock for its
//! read-then-delete so only one of them wins a claim.

use crate::backend::{validate_field, Record, StorageBackend};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    key TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (table_name, key)
);

CREATE INDEX IF NOT EXISTS idx_records_owner
    ON records (table_name, json_extract(body, '$.owner_instance_id'));
"#;

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => StoreError::Connection("Connection closed".to_string()),
        other => StoreError::Connection(other.to_string()),
    }
}

fn decode(key: String, body: String) -> StoreResult<Record> {
    Ok(Record {
        key,
        body: serde_json::from_str(&body)?,
    })
}

/// [`StorageBackend`] over a single SQLite file.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Connection,
    path: String,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening sync store");

        let conn = Connection::open(path_str.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let backend = Self {
            conn,
            path: path_str,
        };
        backend.init(true).await?;
        Ok(backend)
    }

    /// Private in-memory database. Not shared with any other connection.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let backend = Self {
            conn,
            path: ":memory:".to_string(),
        };
        backend.init(false).await?;
        Ok(backend)
    }

    async fn init(&self, wal: bool) -> StoreResult<()> {
        self.call(move |conn| {
            if wal {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    ",
                )?;
            }
            conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        debug!(path = %self.path, "Sync store schema ready");
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` on the executor thread and flatten both error layers.
    async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;
        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn put(&self, table: &str, record: Record) -> StoreResult<()> {
        let table = table.to_string();
        let body = serde_json::to_string(&record.body)?;
        let key = record.key;
        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO records (table_name, key, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![table, key, body, now_ms()],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    conn.execute(
                        "UPDATE records SET body = ?3, updated_at = ?4
                         WHERE table_name = ?1 AND key = ?2",
                        params![table, key, body, now_ms()],
                    )?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, table: &str, keys: &[String]) -> StoreResult<Vec<Record>> {
        let table = table.to_string();
        let keys = keys.to_vec();
        self.call(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key, body FROM records WHERE table_name = ?1 AND key = ?2",
            )?;
            let mut records = Vec::with_capacity(keys.len());
            for key in &keys {
                let row: Option<(String, String)> = stmt
                    .query_row(params![table, key], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?;
                if let Some((key, body)) = row {
                    records.push(decode(key, body)?);
                }
            }
            Ok(records)
        })
        .await
    }

    async fn delete(&self, table: &str, keys: &[String]) -> StoreResult<usize> {
        let table = table.to_string();
        let keys = keys.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt =
                    tx.prepare_cached("DELETE FROM records WHERE table_name = ?1 AND key = ?2")?;
                for key in &keys {
                    removed += stmt.execute(params![table, key])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn scan_all(&self, table: &str) -> StoreResult<Vec<Record>> {
        let table = table.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT key, body FROM records WHERE table_name = ?1 ORDER BY rowid",
                )?;
            let rows = stmt
                .query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            rows.into_iter()
                .map(|(key, body)| decode(key, body))
                .collect()
        })
        .await
    }

    async fn scan_by_index(
        &self,
        table: &str,
        index: &str,
        value: &str,
    ) -> StoreResult<Vec<Record>> {
        validate_field(index)?;
        // Literal path so the expression index can match.
        let sql = format!(
            "SELECT key, body FROM records
             WHERE table_name = ?1 AND json_extract(body, '$.{index}') = ?2
             ORDER BY rowid"
        );
        let table = table.to_string();
        let value = value.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![table, value], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            rows.into_iter()
                .map(|(key, body)| decode(key, body))
                .collect()
        })
        .await
    }

    async fn take_if(
        &self,
        table: &str,
        key: &str,
        field: &str,
        expected: &str,
    ) -> StoreResult<Option<Record>> {
        validate_field(field)?;
        let select = format!(
            "SELECT body FROM records
             WHERE table_name = ?1 AND key = ?2 AND json_extract(body, '$.{field}') = ?3"
        );
        let table = table.to_string();
        let key = key.to_string();
        let expected = expected.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let body: Option<String> = tx
                .query_row(&select, params![table, key, expected], |row| row.get(0))
                .optional()?;
            let taken = match body {
                Some(body) => {
                    tx.execute(
                        "DELETE FROM records WHERE table_name = ?1 AND key = ?2",
                        params![table, key],
                    )?;
                    Some(decode(key, body)?)
                }
                None => None,
            };
            tx.commit()?;
            Ok(taken)
        })
        .await
    }

    async fn clear(&self, table: &str) -> StoreResult<usize> {
        let table = table.to_string();
        self.call(move |conn| {
            Ok(conn.execute("DELETE FROM records WHERE table_name = ?1", params![table])?)
        })
        .await
    }
}
