// src/state_manager.rs

use crate::request::RequestRecord;
use crate::storage::{StorageError, StorageSnapshot};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] StorageError),
}

/// A request record together with the storage snapshot taken for it, if any.
#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub record: RequestRecord,
    pub snapshot: Option<StorageSnapshot>,
}

/// Persists request records and storage snapshots to an SQLite database so a
/// restarted manager can resume partially downloaded requests.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens the database file, creating the schema if needed.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// Private in-memory database; useful for tests.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS requests (
                        target          TEXT PRIMARY KEY,
                        record          TEXT NOT NULL,
                        snapshot        BLOB
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the record for `record.spec.target`.
    pub async fn save_request(
        &self,
        record: &RequestRecord,
        snapshot: Option<&StorageSnapshot>,
    ) -> Result<(), StateError> {
        let target = record.spec.target.clone();
        let record_data = serde_json::to_string(record)?;
        let snapshot_data = snapshot.map(StorageSnapshot::encode).transpose()?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO requests (target, record, snapshot) VALUES (?1, ?2, ?3)",
                    params![target, record_data, snapshot_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<StoredRequest>, StateError> {
        let rows: Vec<(String, Option<Vec<u8>>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record, snapshot FROM requests ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        let mut stored = Vec::with_capacity(rows.len());
        for (record_data, snapshot_data) in rows {
            let record: RequestRecord = serde_json::from_str(&record_data)?;
            let snapshot = snapshot_data
                .as_deref()
                .map(StorageSnapshot::decode)
                .transpose()?;
            stored.push(StoredRequest { record, snapshot });
        }
        Ok(stored)
    }

    pub async fn delete_request(&self, target: &str) -> Result<(), StateError> {
        let target = target.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM requests WHERE target = ?1", params![target])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM requests", [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
