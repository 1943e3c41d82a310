//! Single-slot retry descriptor for remote work that failed.
//!
//! A new push failure overwrites the slot: the descriptor always carries the
//! latest full snapshot, so replaying it supersedes every earlier attempt.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::Value;

use crate::cache::{LocalCache, PENDING_SYNC_KEY, PENDING_SYNC_RESOLVED_KEY};
use crate::error::Result;
use crate::models::{ApplicationStats, PendingSync};

/// Descriptors older than this are dropped without a replay.
pub const STALE_AFTER_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// Nothing queued.
    Idle,
    /// Dropped unreplayed (stale, or not replayable for this session).
    Discarded,
    Pushed,
    Pulled,
    /// The remote is still unreachable; the descriptor stays as it was.
    StillPending,
}

impl PendingSync {
    /// Staleness is measured from the original failure, never from a retry.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.timestamp).num_seconds() > STALE_AFTER_SECS
    }
}

pub fn load<C: LocalCache>(cache: &C) -> Result<Option<PendingSync>> {
    cache.read(PENDING_SYNC_KEY)
}

pub fn record_push<C: LocalCache>(
    cache: &C,
    user_id: &str,
    stats: &ApplicationStats,
    now: DateTime<Utc>,
) -> Result<()> {
    info!("queueing remote write for {}", user_id);
    cache.write(
        PENDING_SYNC_KEY,
        &PendingSync {
            user_id: user_id.to_string(),
            timestamp: now,
            stats: Some(stats.clone()),
            pull_only: false,
        },
    )
}

/// Queue a catch-up pull. Never displaces a queued push, which holds data the
/// remote has not seen yet. Returns whether the descriptor was written.
pub fn record_pull<C: LocalCache>(cache: &C, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
    if load(cache)?.is_some() {
        debug!("retry slot taken; not queueing pull for {}", user_id);
        return Ok(false);
    }
    info!("queueing catch-up pull for {}", user_id);
    cache.write(
        PENDING_SYNC_KEY,
        &PendingSync {
            user_id: user_id.to_string(),
            timestamp: now,
            stats: None,
            pull_only: true,
        },
    )?;
    Ok(true)
}

pub fn resolve<C: LocalCache>(cache: &C) -> Result<()> {
    cache.remove(&[PENDING_SYNC_KEY])?;
    cache.set(PENDING_SYNC_RESOLVED_KEY, &Value::Bool(true))
}

pub fn discard<C: LocalCache>(cache: &C) -> Result<()> {
    cache.remove(&[PENDING_SYNC_KEY])
}

pub fn was_resolved<C: LocalCache>(cache: &C) -> Result<bool> {
    Ok(cache.read::<bool>(PENDING_SYNC_RESOLVED_KEY)?.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCache;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        "2024-01-01T12:00:00Z".parse().unwrap()
    }

    fn stats() -> ApplicationStats {
        ApplicationStats::new("u1", now().date_naive())
    }

    #[test]
    fn test_push_overwrites_slot() {
        let cache = SqliteCache::open_in_memory().unwrap();
        record_push(&cache, "u1", &stats(), now()).unwrap();

        let mut newer = stats();
        newer.today_count = 2;
        record_push(&cache, "u1", &newer, now() + Duration::minutes(3)).unwrap();

        let pending = load(&cache).unwrap().unwrap();
        assert_eq!(pending.stats.unwrap().today_count, 2);
        assert_eq!(pending.timestamp, now() + Duration::minutes(3));
    }

    #[test]
    fn test_pull_never_displaces_push() {
        let cache = SqliteCache::open_in_memory().unwrap();
        record_push(&cache, "u1", &stats(), now()).unwrap();
        assert!(!record_pull(&cache, "u1", now()).unwrap());
        assert!(!load(&cache).unwrap().unwrap().pull_only);
    }

    #[test]
    fn test_pull_fills_empty_slot() {
        let cache = SqliteCache::open_in_memory().unwrap();
        assert!(record_pull(&cache, "u1", now()).unwrap());
        let pending = load(&cache).unwrap().unwrap();
        assert!(pending.pull_only);
        assert!(pending.stats.is_none());
    }

    #[test]
    fn test_staleness_boundary() {
        let cache = SqliteCache::open_in_memory().unwrap();
        record_push(&cache, "u1", &stats(), now()).unwrap();
        let pending = load(&cache).unwrap().unwrap();
        assert!(!pending.is_stale(now() + Duration::minutes(60)));
        assert!(pending.is_stale(now() + Duration::minutes(61)));
    }

    #[test]
    fn test_resolve_marks_and_clears() {
        let cache = SqliteCache::open_in_memory().unwrap();
        assert!(!was_resolved(&cache).unwrap());
        record_push(&cache, "u1", &stats(), now()).unwrap();
        resolve(&cache).unwrap();
        assert!(load(&cache).unwrap().is_none());
        assert!(was_resolved(&cache).unwrap());
    }
}
