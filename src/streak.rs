//! Daily counter and streak arithmetic. Pure functions; callers persist.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{Result, SyncError};
use crate::models::{ApplicationStats, JobApplication, NewApplication};

/// Applications needed in one day for that day to extend the streak.
pub const DAILY_GOAL: u32 = 20;

/// Close out `stats.last_updated` and move the counters to `today`.
///
/// A day is judged only once it has fully elapsed: the streak grows when the
/// previous day met the goal and was exactly one day ago, and drops to zero
/// otherwise. Returns `stats` untouched when it already represents `today`.
pub fn rollover(mut stats: ApplicationStats, today: NaiveDate) -> ApplicationStats {
    if stats.last_updated == today {
        return stats;
    }

    let diff_days = (today - stats.last_updated).num_days().abs();
    if diff_days > 1 || stats.today_count < DAILY_GOAL {
        stats.streak = 0;
    } else {
        stats.streak += 1;
    }

    stats.today_count = 0;
    stats.last_updated = today;
    stats
}

/// Record a new application as the single undo-able entry.
///
/// The first application of a new day goes through [`rollover`] before it is
/// counted, so day transitions follow one rule no matter which path sees them.
pub fn track_application(
    stats: ApplicationStats,
    application: NewApplication,
    now: DateTime<Utc>,
    today: NaiveDate,
) -> ApplicationStats {
    let mut stats = rollover(stats, today);

    for job in &mut stats.applied_jobs {
        job.last_tracked = false;
    }

    let NewApplication {
        url,
        title,
        favicon,
        company,
        tags,
    } = application;

    stats.applied_jobs.insert(
        0,
        JobApplication {
            url,
            title,
            date: today,
            timestamp: now,
            last_tracked: true,
            favicon,
            company,
            tags,
        },
    );
    stats.today_count += 1;
    stats
}

/// Undo the most recently tracked application.
///
/// The streak is never decremented here: removal corrects a miscount, it does
/// not retroactively judge a day.
pub fn remove_application(mut stats: ApplicationStats, today: NaiveDate) -> Result<ApplicationStats> {
    let index = stats
        .applied_jobs
        .iter()
        .position(|job| job.last_tracked)
        .ok_or(SyncError::NoTrackedEntry)?;

    let removed = stats.applied_jobs.remove(index);
    if removed.date == today && stats.today_count > 0 {
        stats.today_count -= 1;
    }

    for job in &mut stats.applied_jobs {
        job.last_tracked = false;
    }
    if let Some(next) = stats.applied_jobs.iter_mut().max_by_key(|job| job.recency()) {
        next.last_tracked = true;
    }

    Ok(stats)
}
