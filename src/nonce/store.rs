//! Durable nonce record
//!
//! One row per connection: `{connection_id, last_nonce, updated_at}`. Writes
//! never move `last_nonce` backwards, so a stale writer cannot undo a lease.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::common::lock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub connection_id: String,
    pub last_nonce: u64,
    pub updated_at: DateTime<Utc>,
}

impl NonceRecord {
    pub fn new(connection_id: impl Into<String>, last_nonce: u64) -> Self {
        Self {
            connection_id: connection_id.into(),
            last_nonce,
            updated_at: Utc::now(),
        }
    }
}

/// Blocking storage for nonce records; callers run it off the async runtime
pub trait NonceStore: Send + Sync {
    fn load(&self, connection_id: &str) -> Result<Option<NonceRecord>>;

    /// Persist `record`, keeping the larger of the stored and new value
    fn save(&self, record: &NonceRecord) -> Result<()>;
}

/// SQLite-backed store
pub struct SqliteNonceStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteNonceStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL keeps the single-row update cheap and crash safe
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nonce_state (
                connection_id TEXT PRIMARY KEY,
                last_nonce INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        info!("Nonce store opened at {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, for inspection
    pub fn records(&self) -> Result<Vec<NonceRecord>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT connection_id, last_nonce, updated_at FROM nonce_state ORDER BY connection_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (connection_id, last_nonce, updated_at) = row?;
            records.push(decode_record(connection_id, last_nonce, &updated_at)?);
        }
        Ok(records)
    }
}

fn decode_record(connection_id: String, last_nonce: i64, updated_at: &str) -> Result<NonceRecord> {
    let last_nonce = u64::try_from(last_nonce)
        .with_context(|| format!("Negative nonce stored for {}", connection_id))?;
    let updated_at = DateTime::parse_from_rfc3339(updated_at)
        .with_context(|| format!("Bad updated_at stored for {}", connection_id))?
        .with_timezone(&Utc);
    Ok(NonceRecord {
        connection_id,
        last_nonce,
        updated_at,
    })
}

impl NonceStore for SqliteNonceStore {
    fn load(&self, connection_id: &str) -> Result<Option<NonceRecord>> {
        let conn = lock(&self.conn);
        let row = conn
            .query_row(
                "SELECT last_nonce, updated_at FROM nonce_state WHERE connection_id = ?1",
                params![connection_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((last_nonce, updated_at)) => {
                let record = decode_record(connection_id.to_string(), last_nonce, &updated_at)?;
                debug!("Loaded nonce record for {}: {}", connection_id, record.last_nonce);
                Ok(Some(record))
            }
            None => {
                debug!("No nonce record for {}", connection_id);
                Ok(None)
            }
        }
    }

    fn save(&self, record: &NonceRecord) -> Result<()> {
        let value = i64::try_from(record.last_nonce)
            .with_context(|| format!("Nonce {} does not fit in SQLite INTEGER", record.last_nonce))?;
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO nonce_state (connection_id, last_nonce, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(connection_id) DO UPDATE SET
                last_nonce = MAX(last_nonce, excluded.last_nonce),
                updated_at = excluded.updated_at",
            params![record.connection_id, value, record.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

/// In-memory store for tests and paper sessions
#[derive(Default)]
pub struct MemoryNonceStore {
    records: Mutex<HashMap<String, NonceRecord>>,
    failures: AtomicU32,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail
    pub fn fail_next_saves(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn last_nonce(&self, connection_id: &str) -> Option<u64> {
        lock(&self.records).get(connection_id).map(|r| r.last_nonce)
    }
}

impl NonceStore for MemoryNonceStore {
    fn load(&self, connection_id: &str) -> Result<Option<NonceRecord>> {
        Ok(lock(&self.records).get(connection_id).cloned())
    }

    fn save(&self, record: &NonceRecord) -> Result<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            bail!("simulated storage failure");
        }

        let mut records = lock(&self.records);
        let entry = records
            .entry(record.connection_id.clone())
            .or_insert_with(|| record.clone());
        entry.last_nonce = entry.last_nonce.max(record.last_nonce);
        entry.updated_at = record.updated_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_round_trip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("nonce.db");

        {
            let store = SqliteNonceStore::open(&path).unwrap();
            assert_eq!(store.load("conn-a").unwrap(), None);
            store.save(&NonceRecord::new("conn-a", 1_700_000_000_000_000)).unwrap();
        }

        let store = SqliteNonceStore::open(&path).unwrap();
        let record = store.load("conn-a").unwrap().unwrap();
        assert_eq!(record.last_nonce, 1_700_000_000_000_000);
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_save_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteNonceStore::open(dir.path().join("nonce.db")).unwrap();

        store.save(&NonceRecord::new("conn-a", 500)).unwrap();
        store.save(&NonceRecord::new("conn-a", 300)).unwrap();
        assert_eq!(store.load("conn-a").unwrap().unwrap().last_nonce, 500);
    }

    #[test]
    fn test_sqlite_connections_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteNonceStore::open(dir.path().join("nonce.db")).unwrap();

        store.save(&NonceRecord::new("conn-a", 10)).unwrap();
        store.save(&NonceRecord::new("conn-b", 20)).unwrap();
        assert_eq!(store.load("conn-a").unwrap().unwrap().last_nonce, 10);
        assert_eq!(store.load("conn-b").unwrap().unwrap().last_nonce, 20);
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryNonceStore::new();
        store.fail_next_saves(1);
        assert!(store.save(&NonceRecord::new("c", 1)).is_err());
        assert!(store.save(&NonceRecord::new("c", 2)).is_ok());
        assert_eq!(store.last_nonce("c"), Some(2));
    }
}
