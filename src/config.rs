//! Application Configuration
//!
//! YAML configuration for the engine and the edge proxy binary. Every
//! section has defaults, so an empty file is a valid configuration.

use crate::backup::{QuotaBackupConfig, DEFAULT_QUOTA_BYTES};
use crate::edge::EdgeConfig;
use crate::error::{Error, Result};
use crate::store::schema::{
    DATABASE_NAME, DATABASE_VERSION, STORE_ALBUM_ART, STORE_COVERS, STORE_LYRICS,
    STORE_PLAYLIST_CACHE, STORE_PLAY_HISTORY,
};
use crate::store::{DatabaseConfig, Schema, StorageBackend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DAY_SECS: u64 = 86_400;

// =============================================================================
// Top Level
// =============================================================================

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseSettings,
    pub backup: BackupSettings,
    pub ttl: TtlConfig,
    pub retention: RetentionConfig,
    pub timeouts: TimeoutConfig,
    pub preferences: PreferenceDefaults,
    pub edge: EdgeConfig,
}

impl AppConfig {
    /// Parse from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&yaml)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.name.is_empty() {
            return Err(Error::Configuration("database.name must not be empty".into()));
        }
        if self.database.version == 0 {
            return Err(Error::Configuration("database.version must be at least 1".into()));
        }
        if self.backup.quota_bytes == 0 {
            return Err(Error::Configuration("backup.quota_bytes must be positive".into()));
        }
        self.timeouts.validate()?;
        self.edge.validate()
    }

    /// Legacy migration needs a durable database
    pub fn validate_legacy_migration(&self) -> Result<()> {
        if self.database.data_dir.is_none() {
            return Err(Error::Configuration(
                "legacy migration requires database.data_dir".into(),
            ));
        }
        Ok(())
    }

    pub fn database_config(&self) -> DatabaseConfig {
        let backend = match &self.database.data_dir {
            Some(dir) => StorageBackend::Directory(dir.clone()),
            None => StorageBackend::InMemory,
        };
        DatabaseConfig {
            name: self.database.name.clone(),
            backend,
            schema: Schema::music_library().at_version(self.database.version),
        }
    }

    pub fn backup_config(&self) -> QuotaBackupConfig {
        QuotaBackupConfig {
            quota_bytes: self.backup.quota_bytes,
            path: self.backup.path.clone(),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Durable object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub name: String,
    /// In-memory when unset
    pub data_dir: Option<PathBuf>,
    pub version: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            name: DATABASE_NAME.to_string(),
            data_dir: None,
            version: DATABASE_VERSION,
        }
    }
}

/// Backup key-value store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Mirror file; in-memory when unset
    pub path: Option<PathBuf>,
    pub quota_bytes: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            path: None,
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

/// Time-to-live per resource family, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Music list, favorites, favorite playlists, playlist songs
    pub listings_secs: u64,
    pub lyrics_secs: u64,
    pub album_art_secs: u64,
    pub covers_secs: u64,
    pub playlist_snapshot_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            listings_secs: DAY_SECS,
            lyrics_secs: 30 * DAY_SECS,
            album_art_secs: 30 * DAY_SECS,
            covers_secs: 30 * DAY_SECS,
            playlist_snapshot_secs: 7 * DAY_SECS,
        }
    }
}

impl TtlConfig {
    pub fn listings(&self) -> Duration {
        Duration::from_secs(self.listings_secs)
    }

    pub fn lyrics(&self) -> Duration {
        Duration::from_secs(self.lyrics_secs)
    }

    pub fn album_art(&self) -> Duration {
        Duration::from_secs(self.album_art_secs)
    }

    pub fn covers(&self) -> Duration {
        Duration::from_secs(self.covers_secs)
    }

    pub fn playlist_snapshot(&self) -> Duration {
        Duration::from_secs(self.playlist_snapshot_secs)
    }
}

/// Retention windows per collection, in days
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub play_history_days: u64,
    pub covers_days: u64,
    pub lyrics_days: u64,
    pub album_art_days: u64,
    pub playlist_cache_days: u64,
    /// Seconds between sweeps
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            play_history_days: 90,
            covers_days: 30,
            lyrics_days: 30,
            album_art_days: 30,
            playlist_cache_days: 7,
            interval_secs: 6 * 3600,
        }
    }
}

impl RetentionConfig {
    /// `(collection, max_age)` pairs; a zero window disables that collection
    pub fn windows(&self) -> Vec<(&'static str, Duration)> {
        [
            (STORE_PLAY_HISTORY, self.play_history_days),
            (STORE_COVERS, self.covers_days),
            (STORE_LYRICS, self.lyrics_days),
            (STORE_ALBUM_ART, self.album_art_days),
            (STORE_PLAYLIST_CACHE, self.playlist_cache_days),
        ]
        .into_iter()
        .filter(|(_, days)| *days > 0)
        .map(|(name, days)| (name, Duration::from_secs(days * DAY_SECS)))
        .collect()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Network timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub metadata_ms: u64,
    pub lyrics_ms: u64,
    pub album_art_ms: u64,
    pub binary_ms: u64,
    pub legacy_item_ms: u64,
    pub edge_upstream_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            metadata_ms: 5_000,
            lyrics_ms: 3_000,
            album_art_ms: 3_000,
            binary_ms: 3_000,
            legacy_item_ms: 3_000,
            edge_upstream_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    fn validate(&self) -> Result<()> {
        let all = [
            ("metadata_ms", self.metadata_ms),
            ("lyrics_ms", self.lyrics_ms),
            ("album_art_ms", self.album_art_ms),
            ("binary_ms", self.binary_ms),
            ("legacy_item_ms", self.legacy_item_ms),
            ("edge_upstream_ms", self.edge_upstream_ms),
        ];
        match all.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(Error::Configuration(format!(
                "timeouts.{} must be positive",
                name
            ))),
            None => Ok(()),
        }
    }

    pub fn metadata(&self) -> Duration {
        Duration::from_millis(self.metadata_ms)
    }

    pub fn lyrics(&self) -> Duration {
        Duration::from_millis(self.lyrics_ms)
    }

    pub fn album_art(&self) -> Duration {
        Duration::from_millis(self.album_art_ms)
    }

    pub fn binary(&self) -> Duration {
        Duration::from_millis(self.binary_ms)
    }

    pub fn legacy_item(&self) -> Duration {
        Duration::from_millis(self.legacy_item_ms)
    }

    pub fn edge_upstream(&self) -> Duration {
        Duration::from_millis(self.edge_upstream_ms)
    }
}

/// Initial values of the user preference toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceDefaults {
    pub cache_covers: bool,
    pub cache_lyrics: bool,
    pub offline_mode: bool,
}

impl Default for PreferenceDefaults {
    fn default() -> Self {
        Self {
            cache_covers: true,
            cache_lyrics: true,
            offline_mode: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config.database.name, DATABASE_NAME);
        assert_eq!(config.database.version, DATABASE_VERSION);
        assert_eq!(config.ttl.listings(), Duration::from_secs(DAY_SECS));
        assert_eq!(config.timeouts.metadata(), Duration::from_secs(5));
        assert_eq!(config.backup.quota_bytes, DEFAULT_QUOTA_BYTES);
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
database:
  data_dir: /var/lib/2fmusic
retention:
  covers_days: 0
timeouts:
  binary_ms: 2000
edge:
  cache_version: 2fmusic-v2
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.database_config().backend,
            StorageBackend::Directory(PathBuf::from("/var/lib/2fmusic"))
        );
        assert_eq!(config.timeouts.binary(), Duration::from_secs(2));
        assert_eq!(config.timeouts.lyrics(), Duration::from_secs(3));
        assert_eq!(config.edge.cache_version, "2fmusic-v2");

        let windows = config.retention.windows();
        assert_eq!(windows.len(), 4);
        assert!(windows.iter().all(|(name, _)| *name != STORE_COVERS));
        assert_eq!(
            windows.iter().find(|(n, _)| *n == STORE_PLAY_HISTORY).unwrap().1,
            Duration::from_secs(90 * DAY_SECS)
        );
    }

    #[test]
    fn test_validation() {
        assert_matches!(
            AppConfig::from_yaml("backup:\n  quota_bytes: 0\n"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            AppConfig::from_yaml("timeouts:\n  metadata_ms: 0\n"),
            Err(Error::Configuration(msg)) if msg.contains("metadata_ms")
        );
        assert_matches!(
            AppConfig::from_yaml("edge:\n  cache_version: ''\n"),
            Err(Error::Configuration(_))
        );
        assert_matches!(AppConfig::from_yaml("database: ["), Err(Error::YamlParse(_)));
    }

    #[test]
    fn test_legacy_migration_needs_durable_database() {
        let config = AppConfig::from_yaml("backup:\n  path: /var/lib/2fmusic/backup.json\n").unwrap();
        assert_matches!(
            config.validate_legacy_migration(),
            Err(Error::Configuration(msg)) if msg.contains("data_dir")
        );

        let config = AppConfig::from_yaml("database:\n  data_dir: /var/lib/2fmusic\n").unwrap();
        assert_matches!(config.validate_legacy_migration(), Ok(()));
    }
}
