use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::time::to_storage_string;
use super::types::Event;

#[derive(Clone)]
pub struct DatabaseLogger {
    connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(format!("Failed to create directory: {}", e)),
                ));
            }
            tracing::info!("Created database directory: {}", parent.display());
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS completion_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                name TEXT NOT NULL,
                source TEXT NOT NULL,
                identifier TEXT NOT NULL,
                metadata TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS flagged_prompts (
                prompt_hash TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_flagged_prompts_recorded_at
             ON flagged_prompts (recorded_at)",
            [],
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_event(&self, event: &Event) -> Result<i64> {
        let conn = self.connection.lock().await;
        let metadata = serde_json::Value::Object(event.metadata.clone()).to_string();

        conn.execute(
            "INSERT INTO completion_events (timestamp, name, source, identifier, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                to_storage_string(&event.timestamp),
                event.name.as_str(),
                &event.source,
                &event.identifier,
                metadata,
            ),
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Stores a prompt keyed by its SHA-256. Re-recording refreshes the timestamp.
    pub async fn record_flagged_prompt(&self, prompt: &str, now: DateTime<Utc>) -> Result<String> {
        let hash = prompt_hash(prompt);
        let conn = self.connection.lock().await;

        conn.execute(
            "INSERT INTO flagged_prompts (prompt_hash, prompt, recorded_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(prompt_hash) DO UPDATE SET recorded_at = excluded.recorded_at",
            (&hash, prompt, to_storage_string(&now)),
        )?;

        Ok(hash)
    }

    pub async fn purge_flagged_prompts_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM flagged_prompts WHERE recorded_at < ?1",
            [to_storage_string(&cutoff)],
        )
    }
}

pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}
