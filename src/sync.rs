//! Reconciliation between the local cache and the remote document store.
//!
//! Every mutation lands in the cache first and is then pushed as a full
//! snapshot. A failed push leaves the local change in place and parks the
//! snapshot in the retry slot; see `pending`.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use crate::cache::{LocalCache, PENDING_SYNC_KEY, PENDING_SYNC_RESOLVED_KEY, STATS_KEY, USER_KEY};
use crate::clock::Clock;
use crate::document::{self, Document};
use crate::error::{Result, SyncError};
use crate::models::{ApplicationStats, NewApplication, PendingSync, UserProfile};
use crate::notify::Notifier;
use crate::pending::{self, ReplayOutcome};
use crate::protocol::{Message, Response};
use crate::remote::DocumentStore;
use crate::streak;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Loading,
    Synced,
    /// Written locally, remote push in flight.
    Dirty,
    /// Written locally, remote push queued for retry.
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub stats: ApplicationStats,
    /// The remote write is queued rather than done.
    pub pending: bool,
}

#[derive(Debug)]
struct Session {
    initialized: bool,
    connected: bool,
    reconnected: bool,
    state: SyncState,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            initialized: false,
            connected: true,
            reconnected: false,
            state: SyncState::Unsynced,
        }
    }
}

/// What the remote read requires us to write back.
enum Rewrite {
    Nothing,
    /// No document yet: create it from the defaults.
    Create,
    /// Legacy nested or malformed: merge the flattened fields in.
    Flatten,
}

pub struct SyncEngine<C, R, N> {
    cache: C,
    remote: R,
    notifier: N,
    clock: Box<dyn Clock + Send>,
    session: Session,
}

impl<C: LocalCache, R: DocumentStore, N: Notifier> SyncEngine<C, R, N> {
    pub fn new(cache: C, remote: R, notifier: N, clock: Box<dyn Clock + Send>) -> Self {
        Self {
            cache,
            remote,
            notifier,
            clock,
            session: Session::default(),
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn state(&self) -> SyncState {
        self.session.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.connected
    }

    /// Startup pass: pick up whatever an earlier process left in the retry
    /// slot.
    pub fn initialize(&mut self) -> Result<ReplayOutcome> {
        if self.session.initialized {
            return Ok(ReplayOutcome::Idle);
        }
        self.session.initialized = true;
        self.settle_state()?;
        let outcome = self.replay_pending()?;
        info!("session initialized ({:?})", outcome);
        Ok(outcome)
    }

    pub fn teardown(&mut self) {
        debug!("session torn down");
        self.session = Session::default();
    }

    pub fn current_user(&self) -> Result<Option<UserProfile>> {
        self.cache.read(USER_KEY)
    }

    fn require_user(&self) -> Result<UserProfile> {
        self.current_user()?.ok_or(SyncError::NotSignedIn)
    }

    fn is_signed_in(&self, user_id: &str) -> Result<bool> {
        Ok(self.current_user()?.is_some_and(|u| u.uid == user_id))
    }

    /// Cached stats of the signed-in user. Never touches the remote.
    pub fn cached_stats(&self) -> Result<Option<ApplicationStats>> {
        let Some(user) = self.current_user()? else {
            return Ok(None);
        };
        Ok(self
            .cache
            .read::<ApplicationStats>(STATS_KEY)?
            .filter(|stats| stats.is_owned_by(&user.uid)))
    }

    pub fn pending(&self) -> Result<Option<PendingSync>> {
        pending::load(&self.cache)
    }

    pub fn sign_in(&mut self, profile: UserProfile) -> Result<ApplicationStats> {
        if let Some(previous) = self.current_user()? {
            if previous.uid != profile.uid {
                info!("switching user {} -> {}", previous.uid, profile.uid);
                self.cache
                    .remove(&[STATS_KEY, PENDING_SYNC_KEY, PENDING_SYNC_RESOLVED_KEY])?;
            }
        }
        self.cache.write(USER_KEY, &profile)?;

        let result = self.remote.update(&profile.uid, &profile_fields(&profile));
        if let Err(e) = self.track_remote(result) {
            warn!("could not store profile for {}: {}", profile.uid, e);
        }

        let stats = self.load_stats(&profile.uid)?;

        self.notifier.broadcast(&Message::UserLoggedIn);
        match self.replay_pending() {
            Ok(outcome) => debug!("sign-in replay: {:?}", outcome),
            Err(e) => warn!("sign-in replay failed: {}", e),
        }
        self.after_reconnect();
        Ok(self.cached_stats()?.unwrap_or(stats))
    }

    /// Queued remote work is dropped along with the session data.
    pub fn sign_out(&mut self) -> Result<()> {
        self.cache.remove(&[
            USER_KEY,
            STATS_KEY,
            PENDING_SYNC_KEY,
            PENDING_SYNC_RESOLVED_KEY,
        ])?;
        self.session.state = SyncState::Unsynced;
        self.notifier.broadcast(&Message::UserLoggedOut);
        info!("signed out");
        Ok(())
    }

    /// Stats for `user_id`: the cache if it holds this user's record, the
    /// remote otherwise. A remote read failure falls back to zeroed defaults
    /// and queues a catch-up pull.
    pub fn load_stats(&mut self, user_id: &str) -> Result<ApplicationStats> {
        if let Some(cached) = self.cache.read::<ApplicationStats>(STATS_KEY)? {
            if cached.is_owned_by(user_id) {
                self.settle_state()?;
                return Ok(cached);
            }
            let mismatch = SyncError::OwnershipMismatch {
                expected: user_id.to_string(),
                found: cached.user_id,
            };
            warn!("{}; discarding cached stats", mismatch);
            self.cache.remove(&[STATS_KEY])?;
        }

        self.session.state = SyncState::Loading;
        let stats = match self.fetch_remote(user_id) {
            Ok(stats) => stats,
            Err(e) if e.is_remote() => {
                warn!("loading stats for {} from remote failed: {}", user_id, e);
                let defaults = ApplicationStats::new(user_id, self.clock.today());
                self.cache.write(STATS_KEY, &defaults)?;
                pending::record_pull(&self.cache, user_id, self.clock.now())?;
                defaults
            }
            Err(e) => {
                self.session.state = SyncState::Unsynced;
                return Err(e);
            }
        };
        self.settle_state()?;
        Ok(stats)
    }

    /// Run `mutation` on the user's stats, store the result locally and push
    /// it. Errors from `mutation` abort before anything is written.
    pub fn apply_mutation<F>(&mut self, user_id: &str, mutation: F) -> Result<MutationOutcome>
    where
        F: FnOnce(ApplicationStats) -> Result<ApplicationStats>,
    {
        if let Some(queued) = pending::load(&self.cache)? {
            if queued.pull_only && queued.user_id == user_id {
                match self.replay_pending() {
                    Ok(outcome) => debug!("catch-up before write: {:?}", outcome),
                    Err(e) => warn!("catch-up before write failed: {}", e),
                }
            }
        }

        let stats = self.load_stats(user_id)?;
        let updated = mutation(stats)?;

        self.session.state = SyncState::Dirty;
        self.cache.write(STATS_KEY, &updated)?;
        let pending = self.push(user_id, &updated, self.clock.now())?;
        self.settle_state()?;

        self.notifier.broadcast(&Message::RefreshStats);
        self.after_reconnect();
        Ok(MutationOutcome {
            stats: updated,
            pending,
        })
    }

    pub fn track(&mut self, application: NewApplication) -> Result<MutationOutcome> {
        let user = self.require_user()?;
        let now = self.clock.now();
        let today = self.clock.today();
        info!("tracking {}", application.url);
        self.apply_mutation(&user.uid, |stats| {
            Ok(streak::track_application(stats, application, now, today))
        })
    }

    pub fn remove_last(&mut self) -> Result<MutationOutcome> {
        let user = self.require_user()?;
        let today = self.clock.today();
        self.apply_mutation(&user.uid, |stats| streak::remove_application(stats, today))
    }

    /// Roll the signed-in user's counters over when the calendar day moved.
    pub fn check_day_change(&mut self) -> Result<Option<MutationOutcome>> {
        let Some(user) = self.current_user()? else {
            return Ok(None);
        };
        let Some(stats) = self.cached_stats()? else {
            return Ok(None);
        };
        let today = self.clock.today();
        if stats.last_updated == today {
            return Ok(None);
        }
        info!("day changed ({} -> {})", stats.last_updated, today);
        self.apply_mutation(&user.uid, |stats| Ok(streak::rollover(stats, today)))
            .map(Some)
    }

    /// Replace the cached stats with the remote record. Queued local writes
    /// for the same user are flushed first.
    pub fn pull_from_remote(&mut self, user_id: &str) -> Result<ApplicationStats> {
        if let Some(queued) = pending::load(&self.cache)? {
            if !queued.pull_only && queued.user_id == user_id {
                match self.replay_pending() {
                    Ok(outcome) => debug!("flush before pull: {:?}", outcome),
                    Err(e) => warn!("flush before pull failed: {}", e),
                }
            }
        }

        self.session.state = SyncState::Loading;
        match self.fetch_remote(user_id) {
            Ok(stats) => {
                if pending::load(&self.cache)?.is_some_and(|p| p.pull_only && p.user_id == user_id) {
                    pending::resolve(&self.cache)?;
                }
                self.settle_state()?;
                self.notifier.broadcast(&Message::RefreshStats);
                self.after_reconnect();
                Ok(stats)
            }
            Err(e) => {
                if e.is_remote() {
                    pending::record_pull(&self.cache, user_id, self.clock.now())?;
                }
                self.settle_state()?;
                Err(e)
            }
        }
    }

    /// Push the cached stats of the signed-in user.
    pub fn sync(&mut self) -> Result<bool> {
        let user = self.require_user()?;
        let stats = self.cached_stats()?.ok_or(SyncError::NotSignedIn)?;
        let pending = self.push(&user.uid, &stats, self.clock.now())?;
        self.settle_state()?;
        self.after_reconnect();
        Ok(pending)
    }

    /// Push an externally supplied stats object for `user_id`. The cache is
    /// only updated when `user_id` is the signed-in user.
    pub fn update_stats(&mut self, user_id: &str, raw: &Value) -> Result<MutationOutcome> {
        let Value::Object(fields) = raw else {
            return Err(SyncError::MalformedRemoteDocument(user_id.to_string()));
        };
        if let Some(claimed) = fields.get("userId").and_then(Value::as_str) {
            if claimed != user_id {
                return Err(SyncError::OwnershipMismatch {
                    expected: user_id.to_string(),
                    found: claimed.to_string(),
                });
            }
        }
        let now = self.clock.now();
        let stats = document::stats_from_fields(user_id, fields, now, self.clock.today());

        let signed_in = self.is_signed_in(user_id)?;
        if signed_in {
            self.cache.write(STATS_KEY, &stats)?;
        }
        let pending = self.push(user_id, &stats, now)?;
        self.settle_state()?;
        if signed_in {
            self.notifier.broadcast(&Message::RefreshStats);
        }
        self.after_reconnect();
        Ok(MutationOutcome { stats, pending })
    }

    /// One pass over the retry slot.
    pub fn replay_pending(&mut self) -> Result<ReplayOutcome> {
        let Some(queued) = pending::load(&self.cache)? else {
            return Ok(ReplayOutcome::Idle);
        };
        let now = self.clock.now();
        if queued.is_stale(now) {
            info!(
                "dropping stale pending sync for {} from {}",
                queued.user_id, queued.timestamp
            );
            pending::discard(&self.cache)?;
            self.settle_state()?;
            return Ok(ReplayOutcome::Discarded);
        }

        if queued.pull_only {
            if !self.is_signed_in(&queued.user_id)? {
                debug!("{} is not signed in; dropping catch-up pull", queued.user_id);
                pending::discard(&self.cache)?;
                self.settle_state()?;
                return Ok(ReplayOutcome::Discarded);
            }
            return match self.fetch_remote(&queued.user_id) {
                Ok(_) => {
                    pending::resolve(&self.cache)?;
                    self.settle_state()?;
                    self.notifier.broadcast(&Message::RefreshStats);
                    Ok(ReplayOutcome::Pulled)
                }
                Err(e) if e.is_remote() => {
                    debug!("catch-up pull still failing: {}", e);
                    Ok(ReplayOutcome::StillPending)
                }
                Err(e) => Err(e),
            };
        }

        let stats = match queued.stats {
            Some(stats) => stats,
            None => match self.cache.read::<ApplicationStats>(STATS_KEY)? {
                Some(cached) => cached,
                None => {
                    pending::discard(&self.cache)?;
                    self.settle_state()?;
                    return Ok(ReplayOutcome::Discarded);
                }
            },
        };
        if !stats.is_owned_by(&queued.user_id) {
            warn!(
                "{}; dropping pending sync",
                SyncError::OwnershipMismatch {
                    expected: queued.user_id.clone(),
                    found: stats.user_id.clone(),
                }
            );
            pending::discard(&self.cache)?;
            self.settle_state()?;
            return Ok(ReplayOutcome::Discarded);
        }

        match self.write_remote(&queued.user_id, &stats, queued.timestamp) {
            Ok(()) => {
                info!("pending sync for {} delivered", queued.user_id);
                pending::resolve(&self.cache)?;
                self.settle_state()?;
                Ok(ReplayOutcome::Pushed)
            }
            Err(e) if e.is_remote() => {
                debug!("pending sync still failing: {}", e);
                Ok(ReplayOutcome::StillPending)
            }
            Err(e) => Err(e),
        }
    }

    /// Read and normalize a user's remote record without touching the cache.
    pub fn remote_stats(&mut self, user_id: &str) -> Result<ApplicationStats> {
        let now = self.clock.now();
        let today = self.clock.today();
        let result = self.remote.get(user_id);
        let doc = self.track_remote(result)?;
        let has_created_at = doc.as_ref().is_some_and(|d| d.contains_key("createdAt"));

        let (stats, rewrite) = match doc {
            None => (ApplicationStats::new(user_id, today), Rewrite::Create),
            Some(doc) => match document::read_stats(user_id, &doc, now, today) {
                Some(stats) if document::detect_shape(&doc).is_flattened() => (stats, Rewrite::Nothing),
                Some(stats) => {
                    info!("upgrading nested stats document for {}", user_id);
                    (stats, Rewrite::Flatten)
                }
                None if doc.contains_key("stats") || doc.contains_key("appliedJobs") => {
                    warn!(
                        "{}; replacing it with defaults",
                        SyncError::MalformedRemoteDocument(user_id.to_string())
                    );
                    (ApplicationStats::new(user_id, today), Rewrite::Flatten)
                }
                None => {
                    info!("no stats stored for {} yet", user_id);
                    (ApplicationStats::new(user_id, today), Rewrite::Flatten)
                }
            },
        };

        match rewrite {
            Rewrite::Nothing => {}
            Rewrite::Create => {
                info!("creating stats document for {}", user_id);
                let doc = document::with_created_at(document::stats_fields(&stats, now), now);
                let result = self.remote.set(user_id, &doc);
                if let Err(e) = self.track_remote(result) {
                    warn!("could not create stats document for {}: {}", user_id, e);
                    // Only the session's own record may take the retry slot,
                    // and never over work already queued there.
                    if self.is_signed_in(user_id)? && pending::load(&self.cache)?.is_none() {
                        pending::record_push(&self.cache, user_id, &stats, now)?;
                    }
                }
            }
            Rewrite::Flatten => {
                let mut fields = document::stats_fields(&stats, now);
                if !has_created_at {
                    fields = document::with_created_at(fields, now);
                }
                let result = self.remote.update(user_id, &fields);
                if let Err(e) = self.track_remote(result) {
                    warn!("could not rewrite stats document for {}: {}", user_id, e);
                }
            }
        }
        Ok(stats)
    }

    fn fetch_remote(&mut self, user_id: &str) -> Result<ApplicationStats> {
        let stats = self.remote_stats(user_id)?;
        self.cache.write(STATS_KEY, &stats)?;
        Ok(stats)
    }

    /// Full-snapshot write. `createdAt` is only set when this write creates
    /// the document.
    fn write_remote(&mut self, user_id: &str, stats: &ApplicationStats, stamp: DateTime<Utc>) -> Result<()> {
        let fields = document::stats_fields(stats, stamp);
        let existing = self.remote.get(user_id).map_err(|e| match e {
            SyncError::RemoteReadFailed(msg) => SyncError::RemoteWriteFailed(msg),
            other => other,
        });
        let exists = self.track_remote(existing)?.is_some();
        let result = if exists {
            self.remote.update(user_id, &fields)
        } else {
            self.remote.set(user_id, &document::with_created_at(fields, stamp))
        };
        self.track_remote(result)
    }

    /// Returns whether the write was queued instead of done. Failed writes
    /// for anyone but the signed-in user are returned, not queued.
    fn push(&mut self, user_id: &str, stats: &ApplicationStats, stamp: DateTime<Utc>) -> Result<bool> {
        match self.write_remote(user_id, stats, stamp) {
            Ok(()) => {
                if pending::load(&self.cache)?.is_some_and(|p| p.user_id == user_id) {
                    debug!("push for {} supersedes the queued one", user_id);
                    pending::resolve(&self.cache)?;
                }
                Ok(false)
            }
            Err(e) if e.is_remote() => {
                if !self.is_signed_in(user_id)? {
                    warn!("remote write for {} failed: {}", user_id, e);
                    return Err(e);
                }
                warn!("remote write for {} failed, will retry: {}", user_id, e);
                pending::record_push(&self.cache, user_id, stats, self.clock.now())?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn track_remote<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) if !self.session.connected => {
                info!("remote store reachable again");
                self.session.connected = true;
                self.session.reconnected = true;
            }
            Err(e) if e.is_remote() && self.session.connected => {
                warn!("remote store unreachable: {}", e);
                self.session.connected = false;
            }
            _ => {}
        }
        result
    }

    fn after_reconnect(&mut self) {
        if !std::mem::take(&mut self.session.reconnected) {
            return;
        }
        match self.replay_pending() {
            Ok(outcome) => debug!("reconnect replay: {:?}", outcome),
            Err(e) => warn!("reconnect replay failed: {}", e),
        }
    }

    fn settle_state(&mut self) -> Result<()> {
        self.session.state = if pending::load(&self.cache)?.is_some() {
            SyncState::Pending
        } else {
            SyncState::Synced
        };
        Ok(())
    }

    /// Dispatch one inter-view request.
    pub fn handle(&mut self, message: Message) -> Response {
        match message {
            Message::SyncStats => match self.sync() {
                Ok(_) => Response::ok(),
                Err(SyncError::NotSignedIn) => Response::error("Missing user or stats"),
                Err(e) => Response::error(e.to_string()),
            },
            Message::GetStats { user_id: None } => Response::failure("No userId provided"),
            Message::GetStats { user_id: Some(user_id) } => {
                let own = match self.current_user() {
                    Ok(user) => user.is_some_and(|u| u.uid == user_id),
                    Err(e) => return Response::failure(e.to_string()),
                };
                let result = if own {
                    self.pull_from_remote(&user_id)
                } else {
                    self.remote_stats(&user_id)
                };
                self.after_reconnect();
                match result {
                    Ok(stats) => Response::stats(stats, false),
                    Err(e) => Response::failure(e.to_string()),
                }
            }
            Message::UpdateStats {
                user_id: Some(user_id),
                stats: Some(stats),
            } => match self.update_stats(&user_id, &stats) {
                Ok(outcome) => Response::stats(outcome.stats, outcome.pending),
                Err(e) => Response::failure(e.to_string()),
            },
            Message::UpdateStats { .. } => Response::failure("Missing userId or stats"),
            Message::RefreshStats => Response::ok(),
            Message::UserLoggedIn => {
                self.notifier.broadcast(&Message::RefreshStats);
                Response::ok()
            }
            Message::UserLoggedOut => match self.sign_out() {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e.to_string()),
            },
            Message::TrackApplication { application } => match self.track(application) {
                Ok(outcome) => Response::stats(outcome.stats, outcome.pending),
                Err(e) => Response::failure(e.to_string()),
            },
            Message::RemoveApplication => match self.remove_last() {
                Ok(outcome) => Response::stats(outcome.stats, outcome.pending),
                Err(e) => Response::failure(e.to_string()),
            },
        }
    }
}

fn profile_fields(profile: &UserProfile) -> Document {
    let mut fields = Document::new();
    fields.insert("uid".into(), Value::String(profile.uid.clone()));
    for (key, value) in [
        ("displayName", &profile.display_name),
        ("email", &profile.email),
        ("photoURL", &profile.photo_url),
    ] {
        if let Some(value) = value {
            fields.insert(key.into(), Value::String(value.clone()));
        }
    }
    fields
}
