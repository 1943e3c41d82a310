use log::{debug, info, warn};
use serde_json::Value;
use std::cmp::Reverse;

use crate::clock::Clock;
use crate::document::{self, Document};
use crate::error::{Result, SyncError};
use crate::models::{ApplicationStats, FriendSummary, LeaderboardEntry};
use crate::remote::DocumentStore;

const FRIENDS_FIELD: &str = "friends";

fn friend_ids(doc: &Document) -> Vec<String> {
    doc.get(FRIENDS_FIELD)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

fn text(doc: &Document, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn stats_of(id: &str, doc: &Document, clock: &dyn Clock) -> ApplicationStats {
    document::read_stats(id, doc, clock.now(), clock.today())
        .unwrap_or_else(|| ApplicationStats::new(id, clock.today()))
}

fn summary(id: &str, doc: &Document, clock: &dyn Clock) -> FriendSummary {
    FriendSummary {
        id: id.to_string(),
        display_name: text(doc, "displayName"),
        email: text(doc, "email"),
        photo_url: text(doc, "photoURL"),
        stats: stats_of(id, doc, clock),
    }
}

fn store_friends<R: DocumentStore>(store: &R, id: &str, ids: Vec<String>) -> Result<()> {
    let mut fields = Document::new();
    fields.insert(
        FRIENDS_FIELD.to_string(),
        Value::Array(ids.into_iter().map(Value::String).collect()),
    );
    store.update(id, &fields)
}

/// Link `user_id` and the owner of `email` in both directions.
pub fn add_friend<R: DocumentStore>(
    store: &R,
    user_id: &str,
    email: &str,
    clock: &dyn Clock,
) -> Result<FriendSummary> {
    let (friend_id, friend_doc) = store
        .find_by("email", email)?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::FriendNotFound(email.to_string()))?;
    if friend_id == user_id {
        return Err(SyncError::SelfFriend);
    }

    let user_doc = store
        .get(user_id)?
        .ok_or_else(|| SyncError::UnknownUser(user_id.to_string()))?;
    let mut mine = friend_ids(&user_doc);
    if mine.contains(&friend_id) {
        return Err(SyncError::AlreadyFriends(email.to_string()));
    }
    mine.push(friend_id.clone());
    store_friends(store, user_id, mine)?;

    let mut theirs = friend_ids(&friend_doc);
    if !theirs.iter().any(|id| id == user_id) {
        theirs.push(user_id.to_string());
        store_friends(store, &friend_id, theirs)?;
    }

    info!("{} and {} are now friends", user_id, friend_id);
    Ok(summary(&friend_id, &friend_doc, clock))
}

pub fn remove_friend<R: DocumentStore>(store: &R, user_id: &str, friend_id: &str) -> Result<()> {
    for (owner, other) in [(user_id, friend_id), (friend_id, user_id)] {
        let Some(doc) = store.get(owner)? else {
            debug!("no document for {}; nothing to unlink", owner);
            continue;
        };
        let ids = friend_ids(&doc);
        if ids.iter().any(|id| id == other) {
            store_friends(store, owner, ids.into_iter().filter(|id| id != other).collect())?;
        }
    }
    info!("{} and {} are no longer friends", user_id, friend_id);
    Ok(())
}

pub fn list_friends<R: DocumentStore>(
    store: &R,
    user_id: &str,
    clock: &dyn Clock,
) -> Result<Vec<FriendSummary>> {
    let Some(user_doc) = store.get(user_id)? else {
        return Ok(Vec::new());
    };
    let mut friends = Vec::new();
    for id in friend_ids(&user_doc) {
        match store.get(&id)? {
            Some(doc) => friends.push(summary(&id, &doc, clock)),
            None => warn!("friend {} of {} has no document", id, user_id),
        }
    }
    Ok(friends)
}

fn entry(id: &str, doc: &Document, is_current_user: bool, clock: &dyn Clock) -> LeaderboardEntry {
    let stats = stats_of(id, doc, clock);
    LeaderboardEntry {
        id: id.to_string(),
        display_name: text(doc, "displayName")
            .or_else(|| text(doc, "email"))
            .unwrap_or_else(|| id.to_string()),
        photo_url: text(doc, "photoURL"),
        is_current_user,
        streak: stats.streak,
        today_count: stats.today_count,
        total_applications: stats.total_applications(),
    }
}

/// The user and their friends, best streak first, ties broken by today's
/// count.
pub fn leaderboard<R: DocumentStore>(
    store: &R,
    user_id: &str,
    clock: &dyn Clock,
) -> Result<Vec<LeaderboardEntry>> {
    let Some(user_doc) = store.get(user_id)? else {
        return Ok(Vec::new());
    };
    let mut entries = vec![entry(user_id, &user_doc, true, clock)];
    for id in friend_ids(&user_doc) {
        if let Some(doc) = store.get(&id)? {
            entries.push(entry(&id, &doc, false, clock));
        }
    }
    entries.sort_by_key(|e| (Reverse(e.streak), Reverse(e.today_count)));
    Ok(entries)
}
