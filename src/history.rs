//! Listening History
//!
//! Append-only play history keyed by track and play time, plus per-track
//! listen statistics accumulated by read-modify-write.
//!
//! Concurrent `record_listen` calls for one track race; the last completed
//! write wins.

use crate::error::{Error, Result};
use crate::store::schema::{IndexKey, STORE_LISTEN_STATS, STORE_PLAY_HISTORY};
use crate::store::record::Record;
use crate::store::{KeyRange, ObjectStore, ScanDirection, SharedObjectStore};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Index over play time on the history collection
pub const PLAYED_AT_INDEX: &str = "played_at";

/// One play of a track
#[derive(Debug, Clone, PartialEq)]
pub struct PlayEntry {
    pub track: String,
    pub played_at: DateTime<Utc>,
    /// Caller-supplied fields (title, artist, album, ...)
    pub details: Value,
}

impl PlayEntry {
    fn from_record(record: &Record) -> Option<Self> {
        let value = record.payload.as_json()?;
        let track = value.get("track")?.as_str()?.to_string();
        Some(Self {
            track,
            played_at: record.cached_at,
            details: value.clone(),
        })
    }
}

/// Accumulated listening for one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenStats {
    pub track: String,
    pub play_count: u64,
    pub total_seconds: f64,
    /// Unix millis of the latest listen
    pub last_listen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_listen_percent: Option<f64>,
}

impl ListenStats {
    fn new(track: &str) -> Self {
        Self {
            track: track.to_string(),
            play_count: 0,
            total_seconds: 0.0,
            last_listen: 0,
            title: None,
            artist: None,
            average_listen_percent: None,
        }
    }

    pub fn last_listen_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_listen).single()
    }
}

/// History record key; unique per track and play time
pub fn play_key(track: &str, played_at: DateTime<Utc>) -> String {
    format!("{}_{}", track, played_at.timestamp_millis())
}

/// Play history and listen statistics
#[derive(Clone)]
pub struct HistoryLog {
    store: SharedObjectStore,
}

impl HistoryLog {
    pub fn new(store: SharedObjectStore) -> Self {
        Self { store }
    }

    /// Append a play; repeated plays of one track at different times coexist
    pub async fn record_play(
        &self,
        track: &str,
        played_at: DateTime<Utc>,
        details: Value,
    ) -> Result<PlayEntry> {
        let mut fields = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidRecord {
                    key: track.to_string(),
                    reason: format!("play details must be an object, got {}", other),
                })
            }
        };
        fields.insert("track".into(), Value::String(track.to_string()));
        fields.insert("played_at".into(), Value::from(played_at.timestamp_millis()));

        let value = Value::Object(fields);
        let record = Record::json(play_key(track, played_at), value.clone(), None).cached_at(played_at);
        self.store.put(STORE_PLAY_HISTORY, record).await?;
        debug!(track, "Play recorded");

        Ok(PlayEntry {
            track: track.to_string(),
            played_at,
            details: value,
        })
    }

    /// Most recent plays first
    pub async fn recent_plays(&self, limit: usize) -> Result<Vec<PlayEntry>> {
        let mut cursor = self
            .store
            .scan_by_index(
                STORE_PLAY_HISTORY,
                PLAYED_AT_INDEX,
                KeyRange::all(),
                ScanDirection::Descending,
            )
            .await?;

        let mut plays = Vec::with_capacity(limit.min(256));
        while plays.len() < limit {
            match cursor.next().await? {
                Some(record) => plays.extend(PlayEntry::from_record(&record)),
                None => break,
            }
        }
        cursor.finish().await?;
        Ok(plays)
    }

    /// Plays since `since`, oldest first
    pub async fn plays_since(&self, since: DateTime<Utc>) -> Result<Vec<PlayEntry>> {
        let mut cursor = self
            .store
            .scan_by_index(
                STORE_PLAY_HISTORY,
                PLAYED_AT_INDEX,
                KeyRange::lower_bound(IndexKey::millis(since.timestamp_millis()), false),
                ScanDirection::Ascending,
            )
            .await?;

        let mut plays = Vec::new();
        while let Some(record) = cursor.next().await? {
            plays.extend(PlayEntry::from_record(&record));
        }
        cursor.finish().await?;
        Ok(plays)
    }

    /// Add `seconds` of listening to a track's statistics
    pub async fn record_listen(
        &self,
        track: &str,
        seconds: f64,
        at: DateTime<Utc>,
    ) -> Result<ListenStats> {
        let mut stats = match self.store.get(STORE_LISTEN_STATS, track).await? {
            Some(record) => record
                .payload
                .into_json()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_else(|| ListenStats::new(track)),
            None => ListenStats::new(track),
        };

        stats.play_count += 1;
        stats.total_seconds += seconds.max(0.0);
        stats.last_listen = stats.last_listen.max(at.timestamp_millis());

        let record = Record::json(track, serde_json::to_value(&stats)?, None).cached_at(at);
        self.store.put(STORE_LISTEN_STATS, record).await?;
        Ok(stats)
    }

    /// Every track's statistics
    pub async fn listen_stats(&self) -> Result<Vec<ListenStats>> {
        let records = self.store.get_all(STORE_LISTEN_STATS).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| r.payload.into_json())
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Statistics sorted by play count, highest first
    pub async fn top_tracks(&self, limit: usize) -> Result<Vec<ListenStats>> {
        let mut stats = self.listen_stats().await?;
        stats.sort_by(|a, b| b.play_count.cmp(&a.play_count).then_with(|| a.track.cmp(&b.track)));
        stats.truncate(limit);
        Ok(stats)
    }
}
