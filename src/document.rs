//! Remote per-user document layout.
//!
//! Two historical shapes exist: the current flattened one, with the stats
//! fields directly on the user document, and a legacy one that nests them
//! under `stats`. Reads accept both and are lenient about field types;
//! writes always produce the flattened shape.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::models::{ApplicationStats, JobApplication};

pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentShape<'a> {
    Flattened(&'a Document),
    Nested(&'a Document),
    Malformed,
}

impl DocumentShape<'_> {
    pub fn is_flattened(&self) -> bool {
        matches!(self, DocumentShape::Flattened(_))
    }
}

/// Flattened wins when `appliedJobs` is an array on the root, even if a
/// leftover `stats` object is still present.
pub fn detect_shape(doc: &Document) -> DocumentShape<'_> {
    if doc.get("appliedJobs").is_some_and(Value::is_array) {
        return DocumentShape::Flattened(doc);
    }
    match doc.get("stats") {
        Some(Value::Object(nested)) => DocumentShape::Nested(nested),
        _ => DocumentShape::Malformed,
    }
}

/// Build stats from a document of either shape. `None` for malformed ones.
///
/// The document id is the ownership tag, so the result always carries
/// `user_id` regardless of what the document claims.
pub fn read_stats(
    user_id: &str,
    doc: &Document,
    now: DateTime<Utc>,
    today: NaiveDate,
) -> Option<ApplicationStats> {
    match detect_shape(doc) {
        DocumentShape::Flattened(fields) | DocumentShape::Nested(fields) => {
            Some(stats_from_fields(user_id, fields, now, today))
        }
        DocumentShape::Malformed => None,
    }
}

/// Lenient stats from a bare field map (no shape detection).
pub fn stats_from_fields(
    user_id: &str,
    fields: &Document,
    now: DateTime<Utc>,
    today: NaiveDate,
) -> ApplicationStats {
    let mut applied_jobs: Vec<JobApplication> = fields
        .get("appliedJobs")
        .and_then(Value::as_array)
        .map(|jobs| jobs.iter().filter_map(|job| job_from_value(job, now)).collect())
        .unwrap_or_default();
    keep_single_last_tracked(&mut applied_jobs);

    ApplicationStats {
        user_id: user_id.to_string(),
        today_count: counter(fields.get("todayCount")),
        streak: counter(fields.get("streak")),
        last_updated: fields
            .get("lastUpdated")
            .and_then(Value::as_str)
            .and_then(parse_date)
            .unwrap_or(today),
        applied_jobs,
    }
}

fn counter(value: Option<&Value>) -> u32 {
    value
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n > 0.0)
        .map(|n| n.min(u32::MAX as f64) as u32)
        .unwrap_or(0)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    // Accept full ISO timestamps too; only the calendar part matters.
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        // Firestore-style {seconds, nanoseconds}
        Value::Object(obj) => {
            let seconds = obj
                .get("seconds")
                .or_else(|| obj.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::<Utc>::from_timestamp(seconds, nanos.min(999_999_999) as u32)
        }
        _ => None,
    }
}

fn optional_string(obj: &Document, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn job_from_value(value: &Value, now: DateTime<Utc>) -> Option<JobApplication> {
    let obj = value.as_object()?;

    let timestamp = obj.get("timestamp").and_then(parse_timestamp);
    let date = obj
        .get("date")
        .and_then(Value::as_str)
        .and_then(parse_date)
        .or_else(|| timestamp.map(|ts| ts.date_naive()))
        .unwrap_or_else(|| now.date_naive());

    let tags = obj
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(JobApplication {
        url: obj.get("url").and_then(Value::as_str).unwrap_or("").to_string(),
        title: obj.get("title").and_then(Value::as_str).unwrap_or("").to_string(),
        date,
        timestamp: timestamp.unwrap_or(now),
        last_tracked: truthy(obj.get("lastTracked")),
        favicon: optional_string(obj, "favicon"),
        company: optional_string(obj, "company"),
        tags,
    })
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        _ => false,
    }
}

/// Documents written by older clients may flag several entries.
fn keep_single_last_tracked(jobs: &mut [JobApplication]) {
    if jobs.iter().filter(|job| job.last_tracked).count() <= 1 {
        return;
    }
    let newest = jobs
        .iter()
        .enumerate()
        .filter(|(_, job)| job.last_tracked)
        .max_by_key(|(_, job)| job.recency())
        .map(|(i, _)| i);
    for (i, job) in jobs.iter_mut().enumerate() {
        job.last_tracked = Some(i) == newest;
    }
}

/// Flattened fields for a push. `stamp` is when the snapshot was produced.
pub fn stats_fields(stats: &ApplicationStats, stamp: DateTime<Utc>) -> Document {
    let mut fields = match serde_json::to_value(stats) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    fields.insert("_timestamp".to_string(), Value::String(stamp.to_rfc3339()));
    fields
}

pub fn with_created_at(mut fields: Document, created_at: DateTime<Utc>) -> Document {
    fields.insert("createdAt".to_string(), Value::String(created_at.to_rfc3339()));
    fields
}
