//! Derived numbers for the stats views. Everything here is read-only over
//! an `ApplicationStats` snapshot.

use chrono::{Days, NaiveDate};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::models::{ApplicationStats, JobApplication};
use crate::streak::DAILY_GOAL;

/// Most recent first.
pub fn recent(stats: &ApplicationStats, limit: usize) -> Vec<&JobApplication> {
    let mut jobs: Vec<&JobApplication> = stats.applied_jobs.iter().collect();
    jobs.sort_by_key(|job| Reverse(job.recency()));
    jobs.truncate(limit);
    jobs
}

/// Applications per day for the `days` days ending with `today`, oldest
/// first. Days without applications are present with a zero count.
pub fn daily_counts(stats: &ApplicationStats, today: NaiveDate, days: u32) -> Vec<(NaiveDate, u32)> {
    let mut per_day: HashMap<NaiveDate, u32> = HashMap::new();
    for job in &stats.applied_jobs {
        *per_day.entry(job.date).or_default() += 1;
    }
    (0..days)
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(back.into())))
        .map(|day| (day, per_day.get(&day).copied().unwrap_or(0)))
        .collect()
}

/// Trailing average over `min(7, len)` points. The leading points without a
/// full window are `None`.
pub fn moving_average(counts: &[u32]) -> Vec<Option<f64>> {
    let window = counts.len().min(7);
    (0..counts.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let sum: u32 = counts[i + 1 - window..=i].iter().sum();
            Some(f64::from(sum) / window as f64)
        })
        .collect()
}

/// `YYYY-MM` buckets in calendar order.
pub fn by_month(stats: &ApplicationStats) -> Vec<(String, usize)> {
    let mut months: BTreeMap<String, usize> = BTreeMap::new();
    for job in &stats.applied_jobs {
        *months.entry(job.date.format("%Y-%m").to_string()).or_default() += 1;
    }
    months.into_iter().collect()
}

fn ranked<'a>(names: impl Iterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

pub fn by_company(stats: &ApplicationStats) -> Vec<(String, usize)> {
    ranked(stats.applied_jobs.iter().filter_map(|job| job.company.as_deref()))
}

pub fn by_tag(stats: &ApplicationStats) -> Vec<(String, usize)> {
    ranked(
        stats
            .applied_jobs
            .iter()
            .flat_map(|job| job.tags.iter().map(String::as_str)),
    )
}

/// Fraction of the daily goal reached, capped at 1.
pub fn goal_progress(stats: &ApplicationStats) -> f64 {
    (f64::from(stats.today_count) / f64::from(DAILY_GOAL)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn job(url: &str, ts: &str, company: Option<&str>, tags: &[&str]) -> JobApplication {
        let timestamp: DateTime<Utc> = ts.parse().unwrap();
        JobApplication {
            url: url.to_string(),
            title: url.to_string(),
            date: timestamp.date_naive(),
            timestamp,
            last_tracked: false,
            favicon: None,
            company: company.map(String::from),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn stats() -> ApplicationStats {
        let mut stats = ApplicationStats::new("u1", "2024-03-10".parse().unwrap());
        stats.today_count = 2;
        stats.applied_jobs = vec![
            job("a", "2024-02-28T10:00:00Z", Some("Acme"), &["remote"]),
            job("b", "2024-03-10T09:00:00Z", Some("Globex"), &["remote", "rust"]),
            job("c", "2024-03-09T09:00:00Z", Some("Acme"), &[]),
            job("d", "2024-03-10T11:00:00Z", None, &["rust"]),
        ];
        stats
    }

    #[test]
    fn test_recent_orders_by_timestamp() {
        let stats = stats();
        let urls: Vec<&str> = recent(&stats, 3).iter().map(|j| j.url.as_str()).collect();
        assert_eq!(urls, vec!["d", "b", "c"]);
    }

    #[test]
    fn test_daily_counts_fill_gaps() {
        let counts = daily_counts(&stats(), "2024-03-10".parse().unwrap(), 3);
        let values: Vec<u32> = counts.iter().map(|(_, n)| *n).collect();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(counts[0].0, "2024-03-08".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn test_moving_average_window() {
        let avg = moving_average(&[7, 0, 0, 0, 0, 0, 0, 14]);
        assert!(avg[..6].iter().all(Option::is_none));
        assert_eq!(avg[6], Some(1.0));
        assert_eq!(avg[7], Some(2.0));

        // Short series use the whole series as the window.
        assert_eq!(moving_average(&[1, 3]), vec![None, Some(2.0)]);
        assert!(moving_average(&[]).is_empty());
    }

    #[test]
    fn test_groupings() {
        let stats = stats();
        assert_eq!(
            by_month(&stats),
            vec![("2024-02".to_string(), 1), ("2024-03".to_string(), 3)]
        );
        assert_eq!(
            by_company(&stats),
            vec![("Acme".to_string(), 2), ("Globex".to_string(), 1)]
        );
        assert_eq!(
            by_tag(&stats),
            vec![("remote".to_string(), 2), ("rust".to_string(), 2)]
        );
    }

    #[test]
    fn test_goal_progress() {
        let mut stats = stats();
        assert_eq!(goal_progress(&stats), 0.1);
        stats.today_count = 35;
        assert_eq!(goal_progress(&stats), 1.0);
    }
}
