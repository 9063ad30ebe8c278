//! Durable backing stores for cached answers.
//!
//! The in-process [`EvictionStore`](super::EvictionStore) is always the
//! source of lookups. A backing store, when configured, receives a
//! write-through copy of every insertion so a restarted process can warm its
//! cache instead of starting cold.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::Clock;
use crate::error::StoreError;

/// Minimal key/value contract with per-key expiry.
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn set_with_ttl(&self, key: &str, blob: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Blob for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unexpired keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS optigate_kv (
    key            TEXT PRIMARY KEY,
    blob           BLOB NOT NULL,
    expires_at_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_optigate_kv_expiry ON optigate_kv (expires_at_ms);
";

/// SQLite-backed store. Expired rows are invisible to reads and removed by
/// [`SqliteStore::purge_expired`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    location: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteStore {
    /// Open (creating if needed) a store file at `path`.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let location = path.display().to_string();
        let open_err = |reason: String| StoreError::Open {
            path: location.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| open_err(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| open_err(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            location,
        })
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            location: ":memory:".to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Delete expired rows. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms() as i64;
        let removed = self.lock().execute(
            "DELETE FROM optigate_kv WHERE expires_at_ms <= ?1",
            params![now],
        )?;
        Ok(removed)
    }
}

impl BackingStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn set_with_ttl(&self, key: &str, blob: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self
            .clock
            .now_ms()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            .min(i64::MAX as u64) as i64;
        self.lock().execute(
            "INSERT INTO optigate_kv (key, blob, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET blob = excluded.blob, expires_at_ms = excluded.expires_at_ms",
            params![key, blob, expires_at],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_ms() as i64;
        let blob = self
            .lock()
            .query_row(
                "SELECT blob FROM optigate_kv WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms() as i64;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key FROM optigate_kv
             WHERE substr(key, 1, length(?1)) = ?1 AND expires_at_ms > ?2
             ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![prefix, now], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().execute("DELETE FROM optigate_kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}
