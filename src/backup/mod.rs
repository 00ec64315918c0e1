//! Backup Key-Value Store
//!
//! Small synchronous string store used only when the durable object store is
//! unavailable or a write to it failed. Writes are bounded by a byte quota and
//! may fail with [`crate::Error::QuotaExceeded`]; callers treat that as a
//! swallowed, logged event.

mod quota;

pub use quota::{QuotaBackupStore, QuotaBackupConfig};

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// =============================================================================
// Key Conventions
// =============================================================================

/// Prefix of write-through envelopes
pub const API_CACHE_PREFIX: &str = "2f_api_cache_";

/// Prefix of cover source URLs
pub const COVER_URL_PREFIX: &str = "2f_cover_url_";

/// Prefix of cover URL write times (RFC 3339)
pub const COVER_TIME_PREFIX: &str = "2f_cover_time_";

/// Prefixes owned by the application; `clear_all` removes only these
pub const APP_KEY_PREFIXES: &[&str] = &["2f_", "2fmusic_"];

/// Default byte quota
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024;

/// Usage above which the store is reported as near its limit
pub const NEAR_LIMIT_BYTES: u64 = 5 * 1024 * 1024;

pub fn api_cache_key(cache_key: &str) -> String {
    format!("{}{}", API_CACHE_PREFIX, cache_key)
}

pub fn cover_url_key(id: &str) -> String {
    format!("{}{}", COVER_URL_PREFIX, id)
}

pub fn cover_time_key(id: &str) -> String {
    format!("{}{}", COVER_TIME_PREFIX, id)
}

/// Whether a key belongs to the application namespaces
pub fn is_app_key(key: &str) -> bool {
    APP_KEY_PREFIXES.iter().any(|p| key.starts_with(p))
}

// =============================================================================
// BackupStore Trait
// =============================================================================

/// Synchronous size-bounded string store
pub trait BackupStore: Send + Sync {
    /// Get a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value, returning whether it existed
    fn remove(&self, key: &str) -> Result<bool>;

    /// Every key in insertion order
    fn keys(&self) -> Result<Vec<String>>;

    /// Current usage against the quota
    fn usage(&self) -> BackupUsage;
}

/// Type alias for a shared backup store
pub type SharedBackupStore = Arc<dyn BackupStore>;

/// Byte usage of a backup store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupUsage {
    pub bytes: u64,
    pub quota: u64,
    pub near_limit: bool,
}

impl BackupUsage {
    pub fn new(bytes: u64, quota: u64) -> Self {
        Self {
            bytes,
            quota,
            near_limit: bytes > NEAR_LIMIT_BYTES.min(quota / 10 * 9),
        }
    }

    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.bytes)
    }

    pub fn megabytes(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Write-through copy of a network response kept in the backup store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub data: Value,
    /// Write time in Unix millis
    pub timestamp: i64,
    /// Time-to-live in millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Envelope {
    pub fn new(key: impl Into<String>, data: Value, ttl_ms: Option<u64>) -> Self {
        Self {
            key: key.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
            ttl: ttl_ms,
        }
    }

    pub fn written_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_helpers() {
        assert_eq!(api_cache_key("music_list"), "2f_api_cache_music_list");
        assert_eq!(cover_url_key("a.mp3"), "2f_cover_url_a.mp3");
        assert_eq!(cover_time_key("a.mp3"), "2f_cover_time_a.mp3");
        assert!(is_app_key("2fmusic_playlist"));
        assert!(!is_app_key("theme"));
    }

    #[test]
    fn test_usage_near_limit() {
        assert!(!BackupUsage::new(1024, DEFAULT_QUOTA_BYTES).near_limit);
        assert!(BackupUsage::new(NEAR_LIMIT_BYTES + 1, DEFAULT_QUOTA_BYTES).near_limit);
        // Small quotas flag relative to themselves
        assert!(BackupUsage::new(95, 100).near_limit);
        assert!(!BackupUsage::new(80, 100).near_limit);
        assert_eq!(BackupUsage::new(30, 100).available(), 70);
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::new("favorites", json!({"data": ["a"]}), Some(1000));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["key"], "favorites");
        assert_eq!(value["ttl"], 1000);
        assert!(envelope.written_at().is_some());
    }
}
