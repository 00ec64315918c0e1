//! Cache Events
//!
//! Events emitted by the cache engine for monitoring and tests.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default broadcast capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tier a read was answered from or a write was aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Network,
    Database,
    Backup,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Network => write!(f, "network"),
            CacheTier::Database => write!(f, "database"),
            CacheTier::Backup => write!(f, "backup"),
        }
    }
}

/// Events emitted by the cache engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEvent {
    /// Network answered and the result was returned fresh
    Fresh { key: String },

    /// A cache tier answered after the network failed or was skipped
    Served {
        key: String,
        tier: CacheTier,
        stale: bool,
    },

    /// Every tier missed
    Offline { key: String, stale_rejected: bool },

    /// Best-effort write failed and was swallowed
    WriteFailed {
        key: String,
        tier: CacheTier,
        error: String,
    },

    /// Write landed in the backup store instead of the database
    BackupWrite { key: String },

    /// Cover bytes stored with their renderable form
    CoverStored { id: String, size_bytes: u64 },

    /// Cover byte download failed; only the URL was kept
    CoverUrlOnly { id: String, reason: String },

    /// Record removed on request
    Invalidated { key: String },

    /// Every collection and backup key cleared
    Cleared {
        records_removed: u64,
        backup_keys_removed: u64,
    },

    /// Database dropped and recreated after a version conflict
    StoreRecreated {
        name: String,
        stored: u32,
        requested: u32,
    },

    /// Schema version step failed and was rolled back
    MigrationStepFailed { version: u32, reason: String },

    /// Retention sweep finished for a collection
    Swept { collection: String, deleted: u64 },

    /// Retention sweep failed for a collection
    SweepFailed { collection: String, error: String },

    /// Legacy key moved into the database and removed
    LegacyMigrated { legacy_key: String, records: usize },

    /// Legacy key left in place
    LegacyKept { legacy_key: String, reason: String },
}

impl CacheEvent {
    /// Create a WriteFailed event
    pub fn write_failed(key: &str, tier: CacheTier, error: impl ToString) -> Self {
        CacheEvent::WriteFailed {
            key: key.to_string(),
            tier,
            error: error.to_string(),
        }
    }

    /// Create a Served event
    pub fn served(key: &str, tier: CacheTier, stale: bool) -> Self {
        CacheEvent::Served {
            key: key.to_string(),
            tier,
            stale,
        }
    }

    /// Get the cache key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Fresh { key } => Some(key),
            CacheEvent::Served { key, .. } => Some(key),
            CacheEvent::Offline { key, .. } => Some(key),
            CacheEvent::WriteFailed { key, .. } => Some(key),
            CacheEvent::BackupWrite { key } => Some(key),
            CacheEvent::Invalidated { key } => Some(key),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::WriteFailed { .. }
                | CacheEvent::MigrationStepFailed { .. }
                | CacheEvent::SweepFailed { .. }
                | CacheEvent::StoreRecreated { .. }
        )
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Cloneable broadcaster shared by every component
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; dropped when nobody listens
    pub fn emit(&self, event: CacheEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let served = CacheEvent::served("lyrics_a", CacheTier::Database, true);
        assert_eq!(served.key(), Some("lyrics_a"));
        assert!(!served.is_error());

        let failed = CacheEvent::write_failed("music_list", CacheTier::Backup, "quota");
        assert!(failed.is_error());
        assert_eq!(format!("{}", CacheTier::Backup), "backup");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(CacheEvent::Fresh {
            key: "favorites".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            CacheEvent::Fresh {
                key: "favorites".into()
            }
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new(0).emit(CacheEvent::Invalidated { key: "x".into() });
    }
}
