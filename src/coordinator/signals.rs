//! Runtime Signals
//!
//! User preference toggles and the connectivity hint. Both are read at call
//! time; nothing caches their values.

use crate::config::PreferenceDefaults;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::info;

/// Preference that gates write-through for a resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    CacheCovers,
    CacheLyrics,
}

/// User preference flags
#[derive(Debug)]
pub struct Preferences {
    cache_covers: AtomicBool,
    cache_lyrics: AtomicBool,
    offline_mode: AtomicBool,
}

impl Preferences {
    pub fn new(cache_covers: bool, cache_lyrics: bool, offline_mode: bool) -> Self {
        Self {
            cache_covers: AtomicBool::new(cache_covers),
            cache_lyrics: AtomicBool::new(cache_lyrics),
            offline_mode: AtomicBool::new(offline_mode),
        }
    }

    pub fn from_defaults(defaults: &PreferenceDefaults) -> Self {
        Self::new(
            defaults.cache_covers,
            defaults.cache_lyrics,
            defaults.offline_mode,
        )
    }

    pub fn cache_covers(&self) -> bool {
        self.cache_covers.load(Ordering::Relaxed)
    }

    pub fn cache_lyrics(&self) -> bool {
        self.cache_lyrics.load(Ordering::Relaxed)
    }

    pub fn offline_mode(&self) -> bool {
        self.offline_mode.load(Ordering::Relaxed)
    }

    pub fn set_cache_covers(&self, enabled: bool) {
        self.cache_covers.store(enabled, Ordering::Relaxed);
    }

    pub fn set_cache_lyrics(&self, enabled: bool) {
        self.cache_lyrics.store(enabled, Ordering::Relaxed);
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.offline_mode.store(enabled, Ordering::Relaxed);
    }

    /// Whether a toggle is currently on
    pub fn allows(&self, toggle: Toggle) -> bool {
        match toggle {
            Toggle::CacheCovers => self.cache_covers(),
            Toggle::CacheLyrics => self.cache_lyrics(),
        }
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::from_defaults(&PreferenceDefaults::default())
    }
}

/// Online/offline hint with change notifications
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the state; subscribers are notified only on change
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
