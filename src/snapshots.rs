//! Playlist Snapshots
//!
//! Whole-library and playlist-index snapshots kept in the generic playlist
//! cache with a short TTL. Each record carries a `type` field so the
//! collection's `type` index can tell snapshot kinds apart.

use crate::error::Result;
use crate::store::record::Record;
use crate::store::schema::{playlist_type_for_key, STORE_PLAYLIST_CACHE};
use crate::store::{ObjectStore, SharedObjectStore};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

pub const LIBRARY_KEY: &str = "fullPlaylist";
pub const PLAYLIST_INDEX_KEY: &str = "cachedPlaylists";

/// Snapshot key for one playlist's songs
pub fn playlist_songs_key(playlist_id: &str) -> String {
    format!("playlistSongs_{}", playlist_id)
}

/// A stored snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub data: Value,
    pub cached_at: DateTime<Utc>,
    pub stale: bool,
}

/// Snapshot reader/writer over the playlist cache
#[derive(Clone)]
pub struct PlaylistSnapshots {
    store: SharedObjectStore,
    ttl: Duration,
}

impl PlaylistSnapshots {
    pub fn new(store: SharedObjectStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn save_library(&self, songs: Value) -> Result<()> {
        self.save(LIBRARY_KEY, songs).await
    }

    pub async fn library(&self) -> Result<Option<Snapshot>> {
        self.load(LIBRARY_KEY).await
    }

    pub async fn save_playlist_index(&self, playlists: Value) -> Result<()> {
        self.save(PLAYLIST_INDEX_KEY, playlists).await
    }

    pub async fn playlist_index(&self) -> Result<Option<Snapshot>> {
        self.load(PLAYLIST_INDEX_KEY).await
    }

    pub async fn save_playlist_songs(&self, playlist_id: &str, songs: Value) -> Result<()> {
        self.save(&playlist_songs_key(playlist_id), songs).await
    }

    pub async fn playlist_songs(&self, playlist_id: &str) -> Result<Option<Snapshot>> {
        self.load(&playlist_songs_key(playlist_id)).await
    }

    /// Store a snapshot written at `at` (used when importing older data)
    pub async fn save_at(&self, key: &str, data: Value, at: DateTime<Utc>) -> Result<()> {
        let mut value = json!({ "data": data });
        if let Some(kind) = playlist_type_for_key(key) {
            value["type"] = Value::from(kind);
        }
        let record = Record::json(key, value, Some(self.ttl)).cached_at(at);
        self.store.put(STORE_PLAYLIST_CACHE, record).await
    }

    async fn save(&self, key: &str, data: Value) -> Result<()> {
        self.save_at(key, data, Utc::now()).await
    }

    async fn load(&self, key: &str) -> Result<Option<Snapshot>> {
        let Some(record) = self.store.get(STORE_PLAYLIST_CACHE, key).await? else {
            return Ok(None);
        };
        let stale = record.freshness_at(Utc::now()).is_stale();
        let cached_at = record.cached_at;
        Ok(record.payload.into_json().map(|mut value| Snapshot {
            data: value.get_mut("data").map(Value::take).unwrap_or(Value::Null),
            cached_at,
            stale,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, DatabaseConfig, KeyRange, ScanDirection};
    use crate::store::schema::IndexKey;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    const WEEK: Duration = Duration::from_secs(7 * 86_400);

    async fn snapshots() -> (PlaylistSnapshots, Arc<Database>) {
        let db = Arc::new(Database::open(DatabaseConfig::default()).await.unwrap());
        (PlaylistSnapshots::new(db.clone(), WEEK), db)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (snaps, _) = snapshots().await;
        snaps.save_library(json!([{"filename": "a.mp3"}])).await.unwrap();
        snaps.save_playlist_songs("9", json!(["a.mp3"])).await.unwrap();

        let library = snaps.library().await.unwrap().unwrap();
        assert_eq!(library.data[0]["filename"], "a.mp3");
        assert!(!library.stale);
        assert_eq!(snaps.playlist_songs("9").await.unwrap().unwrap().data, json!(["a.mp3"]));
        assert!(snaps.playlist_index().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_type_index_and_expiry() {
        let (snaps, db) = snapshots().await;
        snaps
            .save_at(PLAYLIST_INDEX_KEY, json!([]), Utc::now() - ChronoDuration::days(8))
            .await
            .unwrap();
        assert!(snaps.playlist_index().await.unwrap().unwrap().stale);

        let mut cursor = db
            .scan_by_index(
                STORE_PLAYLIST_CACHE,
                "type",
                KeyRange::only(IndexKey::Text("playlists".into())),
                ScanDirection::Ascending,
            )
            .await
            .unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap().key, PLAYLIST_INDEX_KEY);
    }
}
