use chrono::Utc;
use log::{debug, warn};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::protocol::Message;

/// Best-effort fan-out to other open views. Delivery is at most once and
/// never reported back to the caller; a view that misses a signal catches up
/// on its next refresh.
pub trait Notifier {
    fn broadcast(&self, message: &Message);
}

static CHANNELS_OPENED: AtomicU64 = AtomicU64::new(0);

/// Message table in the shared cache database. Every process opens its own
/// channel and only sees messages published by other channels.
pub struct SqliteChannel {
    conn: Connection,
    origin: String,
}

/// Read position of one view.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    last_seen: i64,
}

impl SqliteChannel {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        let origin = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis(),
            CHANNELS_OPENED.fetch_add(1, Ordering::Relaxed)
        );
        Ok(Self { conn, origin })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn publish(&self, message: &Message) -> Result<i64> {
        let body = serde_json::to_string(message)
            .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO messages (origin, body) VALUES (?1, ?2)",
            params![self.origin, body],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn.execute(
            "DELETE FROM messages WHERE created_at < datetime('now', '-1 hour')",
            [],
        )?;
        Ok(id)
    }

    /// Start listening from now on; older messages are not replayed.
    pub fn subscribe(&self) -> Result<Subscription> {
        let last_seen = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |row| row.get(0))?;
        Ok(Subscription { last_seen })
    }

    /// Messages from other channels published since the last poll.
    pub fn poll(&self, subscription: &mut Subscription) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, origin, body FROM messages WHERE id > ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([subscription.last_seen], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut messages = Vec::new();
        for (id, origin, body) in rows {
            subscription.last_seen = id;
            if origin == self.origin {
                continue;
            }
            match serde_json::from_str(&body) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("skipping unreadable message #{}: {}", id, e),
            }
        }
        Ok(messages)
    }
}

impl Notifier for SqliteChannel {
    fn broadcast(&self, message: &Message) {
        match self.publish(message) {
            Ok(id) => debug!("broadcast #{} {:?}", id, message),
            Err(e) => warn!("failed to broadcast {:?}: {}", message, e),
        }
    }
}
