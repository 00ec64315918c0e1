//! Cacheable Resources
//!
//! Each resource kind names its collection, cache key, default TTL, network
//! timeout, preference toggle and the test deciding whether a network
//! response is worth caching.

use crate::config::{TimeoutConfig, TtlConfig};
use crate::coordinator::signals::Toggle;
use crate::store::schema::{
    STORE_ALBUM_ART, STORE_FAVORITES, STORE_FAVORITE_PLAYLISTS, STORE_LYRICS, STORE_MUSIC_LIST,
    STORE_PLAYLIST_SONGS,
};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Kind of server-backed metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    MusicList,
    Favorites,
    FavoritePlaylists,
    PlaylistSongs,
    Lyrics,
    AlbumArt,
}

impl ResourceKind {
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::MusicList => STORE_MUSIC_LIST,
            ResourceKind::Favorites => STORE_FAVORITES,
            ResourceKind::FavoritePlaylists => STORE_FAVORITE_PLAYLISTS,
            ResourceKind::PlaylistSongs => STORE_PLAYLIST_SONGS,
            ResourceKind::Lyrics => STORE_LYRICS,
            ResourceKind::AlbumArt => STORE_ALBUM_ART,
        }
    }

    fn key_prefix(&self) -> &'static str {
        match self {
            ResourceKind::MusicList => "music_list",
            ResourceKind::Favorites => "favorites",
            ResourceKind::FavoritePlaylists => "favorite_playlists",
            ResourceKind::PlaylistSongs => "playlist_songs",
            ResourceKind::Lyrics => "lyrics",
            ResourceKind::AlbumArt => "album_art",
        }
    }

    pub fn default_ttl(&self, ttl: &TtlConfig) -> Duration {
        match self {
            ResourceKind::Lyrics => ttl.lyrics(),
            ResourceKind::AlbumArt => ttl.album_art(),
            _ => ttl.listings(),
        }
    }

    pub fn default_timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        match self {
            ResourceKind::Lyrics => timeouts.lyrics(),
            ResourceKind::AlbumArt => timeouts.album_art(),
            _ => timeouts.metadata(),
        }
    }

    /// Preference that must be on for write-through
    pub fn toggle(&self) -> Option<Toggle> {
        match self {
            ResourceKind::Lyrics => Some(Toggle::CacheLyrics),
            ResourceKind::AlbumArt => Some(Toggle::CacheCovers),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_prefix())
    }
}

/// A resource instance: a kind plus its identity (playlist id, query)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: Option<String>,
}

impl Resource {
    pub fn music_list() -> Self {
        Self {
            kind: ResourceKind::MusicList,
            id: None,
        }
    }

    pub fn favorites() -> Self {
        Self {
            kind: ResourceKind::Favorites,
            id: None,
        }
    }

    pub fn favorite_playlists() -> Self {
        Self {
            kind: ResourceKind::FavoritePlaylists,
            id: None,
        }
    }

    pub fn playlist_songs(playlist_id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::PlaylistSongs,
            id: Some(playlist_id.into()),
        }
    }

    pub fn lyrics(query: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Lyrics,
            id: Some(query.into()),
        }
    }

    pub fn album_art(query: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::AlbumArt,
            id: Some(query.into()),
        }
    }

    /// Key shared by the database record and the backup envelope
    pub fn cache_key(&self) -> String {
        match &self.id {
            Some(id) => format!("{}_{}", self.kind.key_prefix(), id),
            None => self.kind.key_prefix().to_string(),
        }
    }

    pub fn collection(&self) -> &'static str {
        self.kind.collection()
    }

    /// Whether a network response should be written through
    pub fn is_cacheable(&self, response: &Value) -> bool {
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return false;
        }
        match self.kind {
            ResourceKind::Lyrics => non_empty(response.get("lyrics")),
            ResourceKind::AlbumArt => non_empty(response.get("album_art")),
            _ => true,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

fn non_empty(field: Option<&Value>) -> bool {
    match field {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}
