//! Database Schema
//!
//! Names the collections of the durable object store, their secondary
//! indexes and the ordered version steps that upgrade older layouts.

use crate::error::{Error, Result};
use crate::store::migrator::MigrationTxn;
use crate::store::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Database name
pub const DATABASE_NAME: &str = "2FMusicDB";

/// Current schema version
pub const DATABASE_VERSION: u32 = 2;

/// Key path that indexes the record write time
pub const CACHED_AT_KEY_PATH: &str = "cached_at";

/// Name of the age index every expiring collection carries
pub const AGE_INDEX: &str = "cached_at";

pub const STORE_MUSIC_LIST: &str = "music_list";
pub const STORE_FAVORITES: &str = "favorites";
pub const STORE_FAVORITE_PLAYLISTS: &str = "favorite_playlists";
pub const STORE_PLAYLIST_SONGS: &str = "playlist_songs";
pub const STORE_LYRICS: &str = "lyrics";
pub const STORE_ALBUM_ART: &str = "album_art";
pub const STORE_COVERS: &str = "covers";
pub const STORE_PLAY_HISTORY: &str = "play_history";
pub const STORE_LISTEN_STATS: &str = "listen_stats";
pub const STORE_PLAYLIST_CACHE: &str = "playlist_cache";

// =============================================================================
// Index Keys
// =============================================================================

/// Value under which a record is filed in a secondary index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Int(i64),
    Text(String),
}

impl IndexKey {
    /// Index key for a timestamp in Unix millis
    pub fn millis(ms: i64) -> Self {
        IndexKey::Int(ms)
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Int(_) => 0,
            IndexKey::Text(_) => 1,
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Int(a), IndexKey::Int(b)) => a.cmp(b),
            (IndexKey::Text(a), IndexKey::Text(b)) => a.cmp(b),
            // Numbers sort before strings
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Int(v) => write!(f, "{}", v),
            IndexKey::Text(v) => write!(f, "{}", v),
        }
    }
}

// =============================================================================
// Index / Collection Schema
// =============================================================================

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// `cached_at` or a top-level field of a JSON payload
    pub key_path: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Index on the record write time
    pub fn age() -> Self {
        Self::new(AGE_INDEX, CACHED_AT_KEY_PATH)
    }

    /// Extract this index's key from a record; None leaves the record unindexed
    pub fn extract(&self, record: &Record) -> Option<IndexKey> {
        if self.key_path == CACHED_AT_KEY_PATH {
            return Some(IndexKey::millis(record.cached_at.timestamp_millis()));
        }
        let field = record.payload.as_json()?.get(&self.key_path)?;
        match field {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(IndexKey::Int),
            Value::String(s) => Some(IndexKey::Text(s.clone())),
            Value::Bool(b) => Some(IndexKey::Int(i64::from(*b))),
            _ => None,
        }
    }
}

/// Collection definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indexes.push(spec);
        self
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

// =============================================================================
// Migration Steps
// =============================================================================

/// Data transformation applied when upgrading to `version`
#[derive(Clone)]
pub struct MigrationStep {
    pub version: u32,
    pub description: &'static str,
    pub apply: fn(&mut MigrationTxn) -> Result<()>,
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Full database layout at one version
#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    pub collections: Vec<CollectionSchema>,
    pub steps: Vec<MigrationStep>,
}

impl Schema {
    /// Empty schema at a version
    pub fn new(version: u32) -> Self {
        Self {
            version,
            collections: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.push(collection);
        self
    }

    pub fn step(mut self, step: MigrationStep) -> Self {
        self.steps.push(step);
        self.steps.sort_by_key(|s| s.version);
        self
    }

    /// The same layout pinned to another version
    pub fn at_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn find(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Steps to run when moving from `from` to this schema's version
    pub fn steps_between(&self, from: u32) -> impl Iterator<Item = &MigrationStep> {
        let to = self.version;
        self.steps
            .iter()
            .filter(move |s| s.version > from && s.version <= to)
    }

    /// The music client's layout
    pub fn music_library() -> Self {
        let expiring = |name: &str| CollectionSchema::new(name).index(IndexSpec::age());

        Schema::new(DATABASE_VERSION)
            .collection(expiring(STORE_MUSIC_LIST))
            .collection(expiring(STORE_FAVORITES))
            .collection(expiring(STORE_FAVORITE_PLAYLISTS))
            .collection(expiring(STORE_PLAYLIST_SONGS))
            .collection(expiring(STORE_LYRICS))
            .collection(expiring(STORE_ALBUM_ART))
            .collection(expiring(STORE_COVERS))
            .collection(
                expiring(STORE_PLAY_HISTORY)
                    .index(IndexSpec::new("track", "track"))
                    .index(IndexSpec::new("played_at", CACHED_AT_KEY_PATH)),
            )
            .collection(
                CollectionSchema::new(STORE_LISTEN_STATS)
                    .index(IndexSpec::new("play_count", "play_count"))
                    .index(IndexSpec::new("last_listen", "last_listen")),
            )
            .collection(expiring(STORE_PLAYLIST_CACHE).index(IndexSpec::new("type", "type")))
            .step(MigrationStep {
                version: 1,
                description: "initial layout",
                apply: |_| Ok(()),
            })
            .step(MigrationStep {
                version: 2,
                description: "backfill playlist snapshot type",
                apply: backfill_playlist_type,
            })
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::music_library()
    }
}

/// Snapshot type implied by a playlist cache key
pub fn playlist_type_for_key(key: &str) -> Option<&'static str> {
    match key {
        "fullPlaylist" => Some("fullPlaylist"),
        "cachedPlaylists" => Some("playlists"),
        k if k.starts_with("playlistSongs_") => Some("playlistSongs"),
        _ => None,
    }
}

fn backfill_playlist_type(txn: &mut MigrationTxn) -> Result<()> {
    let collection = txn.collection_mut(STORE_PLAYLIST_CACHE)?;
    let pending: Vec<Record> = collection
        .values()
        .filter(|r| {
            r.payload
                .as_json()
                .map(|v| v.get("type").is_none())
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    for mut record in pending {
        let Some(kind) = playlist_type_for_key(&record.key) else {
            continue;
        };
        match &mut record.payload {
            crate::store::record::Payload::Json {
                value: Value::Object(map),
            } => {
                map.insert("type".to_string(), Value::String(kind.to_string()));
            }
            _ => {
                return Err(Error::MigrationStep {
                    version: 2,
                    reason: format!("playlist snapshot {} is not an object", record.key),
                })
            }
        }
        collection.put(record)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_key_ordering() {
        assert!(IndexKey::Int(1) < IndexKey::Int(2));
        assert!(IndexKey::Int(i64::MAX) < IndexKey::Text(String::new()));
        assert!(IndexKey::Text("a".into()) < IndexKey::Text("b".into()));
    }

    #[test]
    fn test_index_extraction() {
        let record = Record::json("k", json!({"track": "a.mp3", "play_count": 3}), None);
        assert_eq!(
            IndexSpec::new("track", "track").extract(&record),
            Some(IndexKey::Text("a.mp3".into()))
        );
        assert_eq!(
            IndexSpec::new("pc", "play_count").extract(&record),
            Some(IndexKey::Int(3))
        );
        assert_eq!(IndexSpec::new("m", "missing").extract(&record), None);
        assert_eq!(
            IndexSpec::age().extract(&record),
            Some(IndexKey::Int(record.cached_at.timestamp_millis()))
        );
    }

    #[test]
    fn test_music_library_schema() {
        let schema = Schema::music_library();
        assert_eq!(schema.version, DATABASE_VERSION);
        assert_eq!(schema.collections.len(), 10);
        assert!(schema.find(STORE_COVERS).unwrap().find_index(AGE_INDEX).is_some());
        assert!(schema.find(STORE_LISTEN_STATS).unwrap().find_index(AGE_INDEX).is_none());

        let versions: Vec<u32> = schema.steps_between(0).map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2]);
        let versions: Vec<u32> = schema.steps_between(1).map(|s| s.version).collect();
        assert_eq!(versions, vec![2]);
        assert_eq!(schema.steps_between(2).count(), 0);
    }

    #[test]
    fn test_playlist_type_for_key() {
        assert_eq!(playlist_type_for_key("fullPlaylist"), Some("fullPlaylist"));
        assert_eq!(playlist_type_for_key("cachedPlaylists"), Some("playlists"));
        assert_eq!(playlist_type_for_key("playlistSongs_7"), Some("playlistSongs"));
        assert_eq!(playlist_type_for_key("other"), None);
    }
}
