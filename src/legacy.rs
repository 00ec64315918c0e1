//! Legacy Migrator
//!
//! Moves flat key-value data written by older clients into the database.
//! A legacy key is removed only after every database write for it has
//! succeeded; any parse, database or network failure leaves the key and its
//! value in place. Running the migrator again is a no-op for keys already
//! moved.

use crate::backup::{
    cover_time_key, BackupStore, BackupUsage, SharedBackupStore, COVER_URL_PREFIX,
};
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EventBus};
use crate::history::{HistoryLog, ListenStats};
use crate::network::{with_timeout, SharedFetcher};
use crate::snapshots::{playlist_songs_key, PlaylistSnapshots, LIBRARY_KEY, PLAYLIST_INDEX_KEY};
use crate::store::record::Record;
use crate::store::schema::{STORE_COVERS, STORE_LISTEN_STATS};
use crate::store::{ObjectStore, SharedObjectStore};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LEGACY_PLAY_HISTORY: &str = "2fmusic_play_history";
pub const LEGACY_LISTEN_STATS: &str = "2fmusic_listen_stats";
pub const LEGACY_PLAYLIST: &str = "2fmusic_playlist";
pub const LEGACY_CACHED_PLAYLISTS: &str = "2fmusic_cached_playlists";
pub const LEGACY_CACHED_PLAYLISTS_TIME: &str = "2fmusic_cached_playlists_time";
pub const LEGACY_PLAYLIST_SONGS: &str = "2fmusic_cached_playlist_songs";

/// Migration switches
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyOptions {
    /// Move history and listen statistics even when the backup store has room
    pub force_all: bool,
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyReport {
    /// Legacy keys moved and removed
    pub migrated: usize,
    /// Legacy keys left in place after a failure
    pub failed: usize,
    /// Database records written
    pub records: usize,
    pub usage_before: BackupUsage,
}

/// One-shot mover from the backup store into the database
pub struct LegacyMigrator {
    store: SharedObjectStore,
    backup: SharedBackupStore,
    fetcher: SharedFetcher,
    history: HistoryLog,
    snapshots: PlaylistSnapshots,
    item_timeout: Duration,
    cover_ttl: Duration,
    events: EventBus,
}

impl LegacyMigrator {
    pub fn new(
        store: SharedObjectStore,
        backup: SharedBackupStore,
        fetcher: SharedFetcher,
        playlist_ttl: Duration,
        cover_ttl: Duration,
        item_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            history: HistoryLog::new(store.clone()),
            snapshots: PlaylistSnapshots::new(store.clone(), playlist_ttl),
            store,
            backup,
            fetcher,
            item_timeout,
            cover_ttl,
            events,
        }
    }

    pub async fn run(&self, options: LegacyOptions) -> LegacyReport {
        let usage_before = self.backup.usage();
        let mut report = LegacyReport {
            migrated: 0,
            failed: 0,
            records: 0,
            usage_before,
        };

        if usage_before.near_limit || options.force_all {
            self.migrate(&mut report, LEGACY_PLAY_HISTORY, &[], |raw| {
                self.import_history(raw)
            })
            .await;
            self.migrate(&mut report, LEGACY_LISTEN_STATS, &[], |raw| {
                self.import_listen_stats(raw)
            })
            .await;
        } else {
            debug!(
                megabytes = usage_before.megabytes(),
                "Backup store has room, keeping history in place"
            );
        }

        self.migrate(&mut report, LEGACY_PLAYLIST, &[], |raw| async move {
            let data: Value = serde_json::from_str(&raw)?;
            self.snapshots.save_at(LIBRARY_KEY, data, Utc::now()).await?;
            Ok(1)
        })
        .await;

        let index_time = self
            .backup
            .get(LEGACY_CACHED_PLAYLISTS_TIME)
            .ok()
            .flatten()
            .and_then(|t| parse_time(&Value::String(t)))
            .unwrap_or_else(Utc::now);
        self.migrate(
            &mut report,
            LEGACY_CACHED_PLAYLISTS,
            &[LEGACY_CACHED_PLAYLISTS_TIME],
            |raw| async move {
                let data: Value = serde_json::from_str(&raw)?;
                self.snapshots.save_at(PLAYLIST_INDEX_KEY, data, index_time).await?;
                Ok(1)
            },
        )
        .await;

        self.migrate(&mut report, LEGACY_PLAYLIST_SONGS, &[], |raw| {
            self.import_playlist_songs(raw)
        })
        .await;

        self.migrate_covers(&mut report).await;

        info!(
            migrated = report.migrated,
            failed = report.failed,
            records = report.records,
            "Legacy migration finished"
        );
        report
    }

    /// Import one key; remove it and `companions` only if `import` succeeds
    async fn migrate<F, Fut>(
        &self,
        report: &mut LegacyReport,
        legacy_key: &str,
        companions: &[&str],
        import: F,
    ) where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<usize>>,
    {
        let raw = match self.backup.get(legacy_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!(legacy_key, error = %e, "Legacy key unreadable");
                return;
            }
        };

        match import(raw).await {
            Ok(records) => {
                for key in std::iter::once(legacy_key).chain(companions.iter().copied()) {
                    if let Err(e) = self.backup.remove(key) {
                        warn!(key, error = %e, "Failed to remove migrated legacy key");
                    }
                }
                report.migrated += 1;
                report.records += records;
                debug!(legacy_key, records, "Legacy key migrated");
                self.events.emit(CacheEvent::LegacyMigrated {
                    legacy_key: legacy_key.to_string(),
                    records,
                });
            }
            Err(e) => {
                report.failed += 1;
                warn!(legacy_key, error = %e, "Legacy key kept");
                self.events.emit(CacheEvent::LegacyKept {
                    legacy_key: legacy_key.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn import_history(&self, raw: String) -> Result<usize> {
        let items: Vec<Value> = serde_json::from_str(&raw)?;
        let mut written = 0;
        for item in items {
            let track = item
                .get("filename")
                .or_else(|| item.get("track"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let played_at = item.get("playedAt").and_then(parse_time);
            let (Some(track), Some(played_at)) = (track, played_at) else {
                debug!("Skipping play history entry without filename or time");
                continue;
            };
            self.history.record_play(&track, played_at, item).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn import_listen_stats(&self, raw: String) -> Result<usize> {
        let entries: serde_json::Map<String, Value> = serde_json::from_str(&raw)?;
        let mut written = 0;
        for (track_key, item) in entries {
            let track = item
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or(&track_key)
                .to_string();
            let number = |names: &[&str]| {
                names
                    .iter()
                    .find_map(|n| item.get(*n).and_then(Value::as_f64))
            };
            let text = |name: &str| item.get(name).and_then(Value::as_str).map(str::to_string);
            let last_listen = ["lastListenTime", "lastPlayed", "lastListen"]
                .iter()
                .find_map(|n| item.get(*n).and_then(parse_time))
                .map(|t| t.timestamp_millis())
                .unwrap_or(0);
            let stats = ListenStats {
                track: track.clone(),
                play_count: number(&["playCount", "count"]).unwrap_or(0.0) as u64,
                total_seconds: number(&["totalListenTime", "totalDuration", "totalTime"])
                    .unwrap_or(0.0),
                last_listen,
                title: text("title"),
                artist: text("artist"),
                average_listen_percent: number(&["averageListenPercent"]),
            };
            let record = Record::json(track, serde_json::to_value(&stats)?, None);
            self.store.put(STORE_LISTEN_STATS, record).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn import_playlist_songs(&self, raw: String) -> Result<usize> {
        let playlists: serde_json::Map<String, Value> = serde_json::from_str(&raw)?;
        let mut written = 0;
        for (playlist_id, songs) in playlists {
            self.snapshots
                .save_at(&playlist_songs_key(&playlist_id), songs, Utc::now())
                .await?;
            written += 1;
        }
        Ok(written)
    }

    /// Re-download every legacy cover URL; failed items keep their keys
    async fn migrate_covers(&self, report: &mut LegacyReport) {
        let keys = match self.backup.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Cannot list backup keys for cover migration");
                return;
            }
        };

        for key in keys.into_iter().filter(|k| k.starts_with(COVER_URL_PREFIX)) {
            let id = key[COVER_URL_PREFIX.len()..].to_string();
            let time_key = cover_time_key(&id);
            self.migrate(report, &key, &[time_key.as_str()], |url| self.import_cover(id.clone(), url))
                .await;
        }
    }

    async fn import_cover(&self, id: String, url: String) -> Result<usize> {
        if url.is_empty() {
            return Err(Error::InvalidRecord {
                key: id,
                reason: "empty cover URL".to_string(),
            });
        }
        let body = with_timeout(&url, self.item_timeout, self.fetcher.fetch_bytes(&url)).await?;
        let record = Record::binary(id, body.bytes, body.content_type, url, Some(self.cover_ttl));
        self.store.put(STORE_COVERS, record).await?;
        Ok(1)
    }
}

/// Unix millis or an RFC 3339 string
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }),
        _ => None,
    }
}
