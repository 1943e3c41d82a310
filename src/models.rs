use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobApplication {
    pub url: String,
    pub title: String,
    pub date: NaiveDate, // user's local calendar day
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_tracked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl JobApplication {
    /// Ordering key for "most recent first" listings.
    pub fn recency(&self) -> (DateTime<Utc>, NaiveDate) {
        (self.timestamp, self.date)
    }
}

/// What a caller knows about a page when it asks to track it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApplication {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub favicon: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStats {
    #[serde(default)]
    pub user_id: String,
    pub today_count: u32,
    pub streak: u32,
    pub last_updated: NaiveDate,
    #[serde(default)]
    pub applied_jobs: Vec<JobApplication>,
}

impl ApplicationStats {
    pub fn new(user_id: &str, today: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            today_count: 0,
            streak: 0,
            last_updated: today,
            applied_jobs: Vec::new(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn last_tracked(&self) -> Option<&JobApplication> {
        self.applied_jobs.iter().find(|job| job.last_tracked)
    }

    pub fn total_applications(&self) -> usize {
        self.applied_jobs.len()
    }
}

/// Single-slot retry record kept in the local cache under `pendingSync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSync {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ApplicationStats>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pull_only: bool,
}

/// Authenticated-user summary stored under the `user` cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "photoURL", default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub stats: ApplicationStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub id: String,
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub is_current_user: bool,
    pub streak: u32,
    pub today_count: u32,
    pub total_applications: usize,
}
