use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::SqliteCache;

pub const DEFAULT_REMOTE_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_COLLECTION: &str = "users";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_path: PathBuf,
    pub remote_url: String,
    pub remote_token: Option<String>,
    pub collection: String,
    pub remote_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let remote_timeout = match var("STREAK_REMOTE_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(
                secs.trim()
                    .parse()
                    .with_context(|| format!("STREAK_REMOTE_TIMEOUT_SECS must be whole seconds, got '{}'", secs))?,
            ),
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Config {
            data_path: var("STREAK_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(SqliteCache::default_path),
            remote_url: var("STREAK_REMOTE_URL").unwrap_or_else(|| DEFAULT_REMOTE_URL.to_string()),
            remote_token: var("STREAK_REMOTE_TOKEN"),
            collection: var("STREAK_COLLECTION").unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            remote_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.remote_url, DEFAULT_REMOTE_URL);
        assert_eq!(config.collection, "users");
        assert_eq!(config.remote_token, None);
        assert_eq!(config.remote_timeout, Duration::from_secs(10));
        assert!(config.data_path.ends_with("streak.db"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STREAK_DATA_PATH", "/tmp/s.db"),
            ("STREAK_REMOTE_URL", "https://db.example.com/v1"),
            ("STREAK_REMOTE_TOKEN", "secret"),
            ("STREAK_COLLECTION", "people"),
            ("STREAK_REMOTE_TIMEOUT_SECS", " 3 "),
        ]))
        .unwrap();
        assert_eq!(config.data_path, PathBuf::from("/tmp/s.db"));
        assert_eq!(config.remote_url, "https://db.example.com/v1");
        assert_eq!(config.remote_token.as_deref(), Some("secret"));
        assert_eq!(config.collection, "people");
        assert_eq!(config.remote_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_empty_is_unset_and_bad_timeout_fails() {
        let config = Config::from_lookup(lookup(&[("STREAK_REMOTE_TOKEN", "")])).unwrap();
        assert_eq!(config.remote_token, None);
        assert!(Config::from_lookup(lookup(&[("STREAK_REMOTE_TIMEOUT_SECS", "soon")])).is_err());
    }
}
