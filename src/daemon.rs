//! Periodic retry and day-change triggers.
//!
//! The engine is synchronous; every call runs on the blocking pool behind a
//! mutex so the timers keep ticking while a slow request is in flight.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};

use crate::cache::LocalCache;
use crate::notify::Notifier;
use crate::remote::DocumentStore;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub retry_every: Duration,
    pub check_every: Duration,
}

impl Schedule {
    pub fn from_minutes(retry: u64, check: u64) -> Self {
        Self {
            retry_every: Duration::from_secs(retry.max(1) * 60),
            check_every: Duration::from_secs(check.max(1) * 60),
        }
    }
}

pub type Shared<C, R, N> = Arc<Mutex<SyncEngine<C, R, N>>>;

async fn blocking<C, R, N, T, F>(engine: &Shared<C, R, N>, step: F) -> Result<T>
where
    C: LocalCache + Send + 'static,
    R: DocumentStore + Send + 'static,
    N: Notifier + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut SyncEngine<C, R, N>) -> crate::error::Result<T> + Send + 'static,
{
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || {
        let mut guard = engine.lock().map_err(|_| anyhow!("Engine lock poisoned"))?;
        step(&mut guard).map_err(anyhow::Error::from)
    })
    .await
    .context("Engine task panicked")?
}

/// Run until `ctrl_c`. Blocks the calling thread.
pub fn run<C, R, N>(engine: SyncEngine<C, R, N>, schedule: Schedule) -> Result<()>
where
    C: LocalCache + Send + 'static,
    R: DocumentStore + Send + 'static,
    N: Notifier + Send + 'static,
{
    let engine = Arc::new(Mutex::new(engine));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(serve(Arc::clone(&engine), schedule, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    }))
}

pub async fn serve<C, R, N, S>(engine: Shared<C, R, N>, schedule: Schedule, shutdown: S) -> Result<()>
where
    C: LocalCache + Send + 'static,
    R: DocumentStore + Send + 'static,
    N: Notifier + Send + 'static,
    S: Future<Output = ()>,
{
    let outcome = blocking(&engine, |e| e.initialize()).await?;
    info!("daemon started, startup replay: {:?}", outcome);
    check_day(&engine).await;

    let mut retry = time::interval(schedule.retry_every);
    let mut check = time::interval(schedule.check_every);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both fire immediately; startup already covered that.
    retry.tick().await;
    check.tick().await;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = retry.tick() => {
                match blocking(&engine, |e| e.replay_pending()).await {
                    Ok(outcome) => debug!("retry tick: {:?}", outcome),
                    Err(e) => warn!("retry tick failed: {:#}", e),
                }
            }
            _ = check.tick() => check_day(&engine).await,
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    blocking(&engine, |e| {
        e.teardown();
        Ok(())
    })
    .await
}

async fn check_day<C, R, N>(engine: &Shared<C, R, N>)
where
    C: LocalCache + Send + 'static,
    R: DocumentStore + Send + 'static,
    N: Notifier + Send + 'static,
{
    match blocking(engine, |e| e.check_day_change()).await {
        Ok(Some(outcome)) => info!(
            "day rolled over: streak {}, pending {}",
            outcome.stats.streak, outcome.pending
        ),
        Ok(None) => debug!("no day change"),
        Err(e) => warn!("day change check failed: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCache;
    use crate::clock::Clock;
    use crate::models::{ApplicationStats, UserProfile};
    use crate::pending;
    use crate::testing::{FixedClock, MemoryDocumentStore, RecordingNotifier};
    use serde_json::json;

    #[test]
    fn test_schedule_from_minutes() {
        let schedule = Schedule::from_minutes(5, 0);
        assert_eq!(schedule.retry_every, Duration::from_secs(300));
        assert_eq!(schedule.check_every, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retry_tick_delivers_queued_write() {
        let store = MemoryDocumentStore::new();
        let clock = FixedClock::at("2024-03-10T09:00:00Z");
        let mut engine = SyncEngine::new(
            SqliteCache::open_in_memory().unwrap(),
            store.clone(),
            RecordingNotifier::default(),
            Box::new(clock.clone()),
        );
        engine
            .sign_in(UserProfile {
                uid: "u1".to_string(),
                display_name: None,
                email: None,
                photo_url: None,
            })
            .unwrap();

        let mut stats = ApplicationStats::new("u1", clock.today());
        stats.today_count = 3;
        pending::record_push(engine.cache(), "u1", &stats, clock.now()).unwrap();
        // The startup pass fails; a later tick has to deliver it.
        store.set_offline(true);

        let engine = Arc::new(Mutex::new(engine));
        let schedule = Schedule {
            retry_every: Duration::from_millis(20),
            check_every: Duration::from_secs(3600),
        };
        let offline = store.clone();
        let shutdown = async move {
            time::sleep(Duration::from_millis(50)).await;
            offline.set_offline(false);
            time::sleep(Duration::from_millis(200)).await;
        };
        serve(Arc::clone(&engine), schedule, shutdown).await.unwrap();

        assert_eq!(store.document("u1").unwrap()["todayCount"], json!(3));
        let engine = engine.lock().unwrap();
        assert!(engine.pending().unwrap().is_none());
        assert_eq!(engine.state(), crate::sync::SyncState::Unsynced);
    }
}
