use crate::models::{ModelKey, TaskRecord};
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
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Durable store for in-flight download tasks, backed by SQLite.
///
/// One row per model key; the row holds the serialized [`TaskRecord`]
/// (configuration, byte offset, partial path). Written on every state
/// transition and periodically during a transfer, so a crash loses at most
/// a few seconds of offset, which resume re-fetches harmlessly.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Open (creating if needed) the task database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS tasks (
                        model_key   TEXT PRIMARY KEY,
                        record      TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert or replace the durable record for a task.
    pub async fn save(&self, key: &ModelKey, record: &TaskRecord) -> Result<(), StateError> {
        let key = key.to_string();
        let record = serde_json::to_string(record)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO tasks (model_key, record) VALUES (?1, ?2)",
                    params![key, record],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Load every persisted task record. Rows that no longer deserialize
    /// (schema drift) are skipped rather than poisoning startup recovery.
    pub async fn load_all(&self) -> Result<Vec<TaskRecord>, StateError> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record FROM tasks")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_str::<TaskRecord>(&row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable task record");
                }
            }
        }
        Ok(records)
    }

    /// Remove the durable record for a key. Absent rows are not an error.
    pub async fn delete(&self, key: &ModelKey) -> Result<(), StateError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE model_key = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
