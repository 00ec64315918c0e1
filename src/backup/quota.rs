//! Quota-Bounded Backup Store
//!
//! Insertion-ordered string map with a byte quota. When a file path is
//! configured the whole map is rewritten as JSON after every change.

use crate::backup::{BackupStore, BackupUsage, DEFAULT_QUOTA_BYTES};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Configuration for the backup store
#[derive(Debug, Clone)]
pub struct QuotaBackupConfig {
    /// Byte quota over keys and values
    pub quota_bytes: u64,
    /// Optional JSON file the map is mirrored to
    pub path: Option<PathBuf>,
}

impl Default for QuotaBackupConfig {
    fn default() -> Self {
        Self {
            quota_bytes: DEFAULT_QUOTA_BYTES,
            path: None,
        }
    }
}

struct Entries {
    map: IndexMap<String, String>,
    bytes: u64,
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// Backup store bounded by a byte quota
pub struct QuotaBackupStore {
    entries: RwLock<Entries>,
    quota_bytes: u64,
    path: Option<PathBuf>,
    available: AtomicBool,
}

impl QuotaBackupStore {
    /// Create an in-memory store with the default quota
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    /// Create an in-memory store with a quota
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(Entries {
                map: IndexMap::new(),
                bytes: 0,
            }),
            quota_bytes,
            path: None,
            available: AtomicBool::new(true),
        }
    }

    /// Open a store, loading the mirror file when one exists
    pub fn open(config: QuotaBackupConfig) -> Result<Self> {
        let mut store = Self::with_quota(config.quota_bytes);
        if let Some(path) = &config.path {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let map: IndexMap<String, String> = serde_json::from_slice(&bytes)?;
                    let total = map.iter().map(|(k, v)| entry_size(k, v)).sum();
                    debug!(path = %path.display(), keys = map.len(), bytes = total, "Loaded backup store");
                    store.entries = RwLock::new(Entries { map, bytes: total });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        store.path = config.path;
        Ok(store)
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Check if available
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BackupUnavailable("backup store is unavailable".to_string()))
        }
    }

    fn mirror(&self, map: &IndexMap<String, String>) {
        let Some(path) = &self.path else {
            return;
        };
        let written = serde_json::to_vec(map)
            .map_err(Error::from)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let tmp = path.with_extension("tmp");
                std::fs::write(&tmp, json)?;
                std::fs::rename(&tmp, path)?;
                Ok(())
            });
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Failed to mirror backup store");
        }
    }
}

impl Default for QuotaBackupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStore for QuotaBackupStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.entries.read().map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_available()?;
        let mut entries = self.entries.write();

        let previous = entries.map.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let needed = entry_size(key, value);
        let base = entries.bytes - previous;
        if base + needed > self.quota_bytes {
            return Err(Error::QuotaExceeded {
                key: key.to_string(),
                needed,
                available: self.quota_bytes.saturating_sub(base),
            });
        }

        entries.map.insert(key.to_string(), value.to_string());
        entries.bytes = base + needed;
        self.mirror(&entries.map);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.write();
        let Some(value) = entries.map.shift_remove(key) else {
            return Ok(false);
        };
        entries.bytes -= entry_size(key, &value);
        self.mirror(&entries.map);
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.entries.read().map.keys().cloned().collect())
    }

    fn usage(&self) -> BackupUsage {
        BackupUsage::new(self.entries.read().bytes, self.quota_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_set_get_remove() {
        let store = QuotaBackupStore::new();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.set("a", "3").unwrap();

        assert_eq!(store.get("a").unwrap().as_deref(), Some("3"));
        assert_eq!(store.keys().unwrap(), vec!["a", "b"]);
        assert_eq!(store.usage().bytes, 4);

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.usage().bytes, 2);
    }

    #[test]
    fn test_quota_exceeded() {
        let store = QuotaBackupStore::with_quota(10);
        store.set("k", "12345").unwrap();
        assert_matches!(
            store.set("big", "1234567"),
            Err(Error::QuotaExceeded {
                needed: 10,
                available: 4,
                ..
            })
        );
        // Replacing a value only counts the difference
        store.set("k", "123456789").unwrap();
        assert_eq!(store.usage().bytes, 10);
        assert_eq!(store.get("big").unwrap(), None);
    }

    #[test]
    fn test_unavailable() {
        let store = QuotaBackupStore::new();
        store.set_available(false);
        assert_matches!(store.get("k"), Err(Error::BackupUnavailable(_)));
        assert_matches!(store.set("k", "v"), Err(Error::BackupUnavailable(_)));
    }

    #[test]
    fn test_file_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        let config = QuotaBackupConfig {
            quota_bytes: 1024,
            path: Some(path.clone()),
        };

        let store = QuotaBackupStore::open(config.clone()).unwrap();
        store.set("2fmusic_playlist", "[]").unwrap();
        store.set("2f_cover_url_a", "http://x/a.jpg").unwrap();
        drop(store);

        let reopened = QuotaBackupStore::open(config).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["2fmusic_playlist", "2f_cover_url_a"]);
        assert_eq!(
            reopened.usage().bytes,
            entry_size("2fmusic_playlist", "[]") + entry_size("2f_cover_url_a", "http://x/a.jpg")
        );
    }
}
