//! Offline Music Cache
//!
//! Offline-first multi-tier cache engine for a music library client, plus an
//! independently running edge cache proxy for application assets and covers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Coordinator                                 │
//! │         network ──► object store ──► backup store ──► offline-empty          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Cover Cache    │  │  History Log    │  │   Playlist Snapshots        │  │
//! │  │ (bytes+data URI)│  │ (plays, stats)  │  │   (7-day TTL)               │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐      ┌──────────────────────┐  │
//! │                    │ Durable Object Store  │      │ Backup KV Store      │  │
//! │                    │ (versioned, migrated) │      │ (quota-bounded)      │  │
//! │                    └───────────┬───────────┘      └──────────┬───────────┘  │
//! │                                │                             │              │
//! │                    ┌───────────┴───────────┐      ┌──────────┴───────────┐  │
//! │                    │  Retention Sweeper    │      │  Legacy Migrator     │  │
//! │                    └───────────────────────┘      └──────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                     Edge Cache Proxy (separate lifecycle)                    │
//! │        install ─► activate ─► cache-first / network-first per route         │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: Durable object store, schema and migrator
//! - [`backup`]: Quota-bounded backup key-value store
//! - [`coordinator`]: Read/write fallback chains and the cover pass
//! - [`history`]: Play history and listen statistics
//! - [`snapshots`]: Playlist snapshots
//! - [`sweeper`]: Age-based retention
//! - [`legacy`]: Migration of flat legacy keys
//! - [`edge`]: Edge cache proxy and its HTTP server
//! - [`config`]: YAML configuration
//! - [`error`]: Error types and handling

pub mod backup;
pub mod config;
pub mod coordinator;
pub mod edge;
pub mod error;
pub mod events;
pub mod history;
pub mod legacy;
pub mod metrics;
pub mod network;
pub mod snapshots;
pub mod store;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use backup::{BackupStore, BackupUsage, QuotaBackupStore, SharedBackupStore};

pub use config::AppConfig;

pub use coordinator::{
    CacheCoordinator, CacheSource, CoordinatorConfig, CoverCache, FetchOptions, FetchOutcome,
    OfflineNoData, Preferences, Connectivity, Resource, ResourceKind,
};

pub use edge::{EdgeCacheProxy, EdgeConfig, EdgeServer, EdgeServerConfig, HttpUpstream};

pub use error::{Disposition, Error, Result};

pub use events::{CacheEvent, EventBus};

pub use history::HistoryLog;

pub use legacy::{LegacyMigrator, LegacyOptions, LegacyReport};

pub use network::{Fetcher, HttpFetcher};

pub use snapshots::PlaylistSnapshots;

pub use store::{
    Database, DatabaseConfig, DatabaseHandle, ObjectStore, Record, SharedObjectStore,
};

pub use sweeper::{RetentionSweeper, SweepReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
