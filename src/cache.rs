use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const USER_KEY: &str = "user";
pub const STATS_KEY: &str = "stats";
pub const PENDING_SYNC_KEY: &str = "pendingSync";
pub const PENDING_SYNC_RESOLVED_KEY: &str = "pendingSyncResolved";

/// Installation-scoped key-value store shared by every process on the machine.
pub trait LocalCache {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: &Value) -> Result<()>;

    fn remove(&self, keys: &[&str]) -> Result<()>;

    fn clear(&self) -> Result<()>;

    /// Increases on every write from any connection; poll it to notice changes.
    fn revision(&self) -> Result<i64>;

    /// A stored value that no longer decodes is reported as absent.
    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>
    where
        Self: Sized,
    {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                warn!("ignoring undecodable cache entry '{}': {}", key, e);
                Ok(None)
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        let value = serde_json::to_value(value)
            .map_err(|e| SyncError::StorageUnavailable(format!("encode '{}': {}", key, e)))?;
        self.set(key, &value)
    }
}

pub struct SqliteCache {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::StorageUnavailable(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        let cache = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        cache.init()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self> {
        let cache = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        cache.init()?;
        Ok(cache)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "streak") {
            proj_dirs.data_dir().join("streak.db")
        } else {
            PathBuf::from("streak.db")
        }
    }

    fn init(&self) -> Result<()> {
        // Several processes share the file; wait on their locks instead of failing.
        self.conn.busy_timeout(Duration::from_secs(5))?;
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS cache_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                revision INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO cache_meta (id, revision) VALUES (1, 0);
            "#,
        )?;
        Ok(())
    }

    fn bump_revision(&self) -> Result<()> {
        self.conn
            .execute("UPDATE cache_meta SET revision = revision + 1 WHERE id = 1", [])?;
        Ok(())
    }
}

impl LocalCache for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| SyncError::StorageUnavailable(format!("decode '{}': {}", key, e)))
        })
        .transpose()
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value.to_string()],
        )?;
        self.bump_revision()
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        }
        self.bump_revision()
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM kv", [])?;
        self.bump_revision()
    }

    fn revision(&self) -> Result<i64> {
        let revision = self.conn.query_row(
            "SELECT revision FROM cache_meta WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PendingSync;
    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let cache = SqliteCache::open_in_memory().unwrap();
        assert_eq!(cache.get("stats").unwrap(), None);

        cache.set("stats", &json!({"streak": 3})).unwrap();
        assert_eq!(cache.get("stats").unwrap(), Some(json!({"streak": 3})));

        cache.set("stats", &json!({"streak": 4})).unwrap();
        assert_eq!(cache.get("stats").unwrap(), Some(json!({"streak": 4})));

        cache.remove(&["stats", "missing"]).unwrap();
        assert_eq!(cache.get("stats").unwrap(), None);
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = SqliteCache::open_in_memory().unwrap();
        cache.set("user", &json!({"uid": "u1"})).unwrap();
        cache.set("pendingSyncResolved", &json!(true)).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.get("user").unwrap(), None);
        assert_eq!(cache.get("pendingSyncResolved").unwrap(), None);
    }

    #[test]
    fn test_revision_moves_on_every_write() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let start = cache.revision().unwrap();
        cache.set("a", &json!(1)).unwrap();
        cache.remove(&["a"]).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.revision().unwrap(), start + 3);
    }

    #[test]
    fn test_read_treats_undecodable_as_absent() {
        let cache = SqliteCache::open_in_memory().unwrap();
        cache.set(PENDING_SYNC_KEY, &json!({"what": "ever"})).unwrap();
        let pending: Option<PendingSync> = cache.read(PENDING_SYNC_KEY).unwrap();
        assert!(pending.is_none());
    }

    #[test]
    fn test_two_connections_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("streak.db");
        let writer = SqliteCache::open(&path).unwrap();
        let reader = SqliteCache::open(&path).unwrap();

        let before = reader.revision().unwrap();
        writer.set(USER_KEY, &json!({"uid": "u1"})).unwrap();

        assert_eq!(reader.get(USER_KEY).unwrap(), Some(json!({"uid": "u1"})));
        assert!(reader.revision().unwrap() > before);
        assert_eq!(writer.path(), Some(path.as_path()));
    }
}
