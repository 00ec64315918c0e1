//! Cache Coordinator
//!
//! Resolves reads for server-backed metadata through the fallback chain
//! network → durable object store → backup store → offline, and writes fresh
//! network results through to the cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        CacheCoordinator                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   network_fn ──ok──► write-through ──► Fresh(value)               │
//! │       │                  │                                        │
//! │      err/timeout         ├─► ObjectStore.put                      │
//! │       │                  └─► BackupStore envelope (on DB failure) │
//! │       ▼                                                           │
//! │   ObjectStore.get ──hit──► Cached { source: Database, stale }     │
//! │       │ miss / unavailable                                        │
//! │       ▼                                                           │
//! │   BackupStore.get ──hit──► Cached { source: Backup, stale }       │
//! │       │ miss                                                      │
//! │       ▼                                                           │
//! │   Offline(OfflineNoData)                                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let outcome = coordinator
//!     .fetch_with_fallback(&Resource::music_list(), || api.list_music())
//!     .await;
//!
//! match outcome {
//!     FetchOutcome::Fresh(value) => render(value),
//!     FetchOutcome::Cached { value, stale, .. } => render_with_badge(value, stale),
//!     FetchOutcome::Offline(empty) => render_json(empty.to_json()),
//! }
//! ```

pub mod cover;
pub mod resource;
pub mod signals;

pub use cover::{CoverCache, CoverSource, CoverStoreOutcome, ResolvedCover};
pub use resource::{Resource, ResourceKind};
pub use signals::{Connectivity, Preferences, Toggle};

use crate::backup::{api_cache_key, is_app_key, BackupStore, Envelope, SharedBackupStore};
use crate::config::{AppConfig, TimeoutConfig, TtlConfig};
use crate::error::{Disposition, Error, Result};
use crate::events::{CacheEvent, CacheTier, EventBus};
use crate::metrics::{CoordinatorMetrics, CoordinatorMetricsSnapshot};
use crate::network::{with_timeout, SharedFetcher};
use crate::store::record::Record;
use crate::store::{ObjectStore, SharedObjectStore};
use chrono::Utc;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

// =============================================================================
// Outcomes
// =============================================================================

/// Cache tier that answered a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Database,
    Backup,
}

/// Every tier missed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineNoData {
    pub key: String,
    /// A cached copy existed but was refused for being stale
    pub stale_rejected: bool,
    pub reason: String,
}

impl OfflineNoData {
    /// Response shape the UI understands
    pub fn to_json(&self) -> Value {
        let message = if self.stale_rejected {
            format!("Offline; cached {} has expired", self.key)
        } else {
            format!("Offline and no cached data for {}", self.key)
        };
        json!({
            "success": false,
            "offline": true,
            "data": [],
            "message": message,
        })
    }
}

/// Result of a read through the fallback chain
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Network answered
    Fresh(Value),
    /// A cache tier answered
    Cached {
        value: Value,
        stale: bool,
        source: CacheSource,
    },
    /// Nothing anywhere
    Offline(OfflineNoData),
}

impl FetchOutcome {
    pub fn is_fresh(&self) -> bool {
        matches!(self, FetchOutcome::Fresh(_))
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, FetchOutcome::Offline(_))
    }

    /// Payload, if any tier produced one
    pub fn value(&self) -> Option<&Value> {
        match self {
            FetchOutcome::Fresh(value) | FetchOutcome::Cached { value, .. } => Some(value),
            FetchOutcome::Offline(_) => None,
        }
    }

    /// Flatten into the JSON shape the UI layer consumes
    pub fn to_json(&self) -> Value {
        match self {
            FetchOutcome::Fresh(value) => value.clone(),
            FetchOutcome::Cached { value, stale, .. } => {
                let mut value = value.clone();
                if let Value::Object(map) = &mut value {
                    map.insert("offline".into(), Value::Bool(true));
                    map.insert("fromCache".into(), Value::Bool(true));
                    map.insert("stale".into(), Value::Bool(*stale));
                }
                value
            }
            FetchOutcome::Offline(empty) => empty.to_json(),
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Refuse stale cache answers
    pub require_fresh: bool,
    /// Override the kind's TTL
    pub ttl: Option<Duration>,
    /// Override the kind's network timeout
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn fresh_only() -> Self {
        Self {
            require_fresh: true,
            ..Default::default()
        }
    }
}

/// Counts from [`CacheCoordinator::clear_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub records_removed: u64,
    pub backup_keys_removed: u64,
}

// =============================================================================
// Configuration
// =============================================================================

/// TTLs and timeouts used by the coordinator
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub ttl: TtlConfig,
    pub timeouts: TimeoutConfig,
}

impl CoordinatorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            ttl: config.ttl.clone(),
            timeouts: config.timeouts.clone(),
        }
    }
}

// =============================================================================
// Cache Coordinator
// =============================================================================

/// Per-resource read/write fallback logic
pub struct CacheCoordinator {
    store: SharedObjectStore,
    backup: SharedBackupStore,
    covers: CoverCache,
    preferences: Arc<Preferences>,
    connectivity: Arc<Connectivity>,
    config: CoordinatorConfig,
    metrics: Arc<CoordinatorMetrics>,
    events: EventBus,
    background: TaskTracker,
}

impl CacheCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: SharedObjectStore,
        backup: SharedBackupStore,
        fetcher: SharedFetcher,
        preferences: Arc<Preferences>,
        connectivity: Arc<Connectivity>,
        events: EventBus,
    ) -> Self {
        let covers = CoverCache::new(
            Arc::clone(&store),
            Arc::clone(&backup),
            fetcher,
            config.ttl.covers(),
            config.timeouts.binary(),
            events.clone(),
        );
        Self {
            store,
            backup,
            covers,
            preferences,
            connectivity,
            config,
            metrics: Arc::new(CoordinatorMetrics::new()),
            events,
            background: TaskTracker::new(),
        }
    }

    pub fn covers(&self) -> &CoverCache {
        &self.covers
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn metrics(&self) -> CoordinatorMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Number of detached cover passes still running
    pub fn pending_background(&self) -> usize {
        self.background.len()
    }

    /// Wait for every detached cover pass
    pub async fn flush_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Try network, fall back to cache
    pub async fn fetch_with_fallback<F, Fut>(&self, resource: &Resource, network: F) -> FetchOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.fetch_with(resource, network, FetchOptions::default()).await
    }

    /// Try network, fall back to cache, with per-call overrides
    pub async fn fetch_with<F, Fut>(
        &self,
        resource: &Resource,
        network: F,
        options: FetchOptions,
    ) -> FetchOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let key = resource.cache_key();
        let ttl = options
            .ttl
            .unwrap_or_else(|| resource.kind.default_ttl(&self.config.ttl));
        let timeout = options
            .timeout
            .unwrap_or_else(|| resource.kind.default_timeout(&self.config.timeouts));

        if self.skip_network() {
            self.metrics.record(&self.metrics.network_skipped);
            debug!(key = %key, "Known offline, skipping network");
        } else {
            match with_timeout(&key, timeout, network()).await {
                Ok(value) => {
                    self.write_through(resource, &key, &value, ttl).await;
                    self.metrics.record(&self.metrics.fresh);
                    self.events.emit(CacheEvent::Fresh { key });
                    return FetchOutcome::Fresh(value);
                }
                Err(e) => {
                    self.metrics.record(&self.metrics.network_failures);
                    if e.disposition() == Disposition::Fallback {
                        info!(key = %key, error = %e, "Network failed, falling back to cache");
                    } else {
                        warn!(key = %key, error = %e, "Unexpected network error, falling back to cache");
                    }
                }
            }
        }

        self.read_cached(resource, &key, ttl, options.require_fresh)
            .await
    }

    /// Try cache, fall back to network
    ///
    /// A fresh database record answers immediately; anything else goes
    /// through the normal chain.
    pub async fn fetch_cache_first<F, Fut>(&self, resource: &Resource, network: F) -> FetchOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let key = resource.cache_key();
        let ttl = resource.kind.default_ttl(&self.config.ttl);

        if let Ok(Some(record)) = self.store.get(resource.collection(), &key).await {
            if !record.freshness_with(Some(ttl), Utc::now()).is_stale() {
                if let Some(value) = record.payload.into_json() {
                    self.metrics.record(&self.metrics.database_hits);
                    self.events
                        .emit(CacheEvent::served(&key, CacheTier::Database, false));
                    return FetchOutcome::Cached {
                        value,
                        stale: false,
                        source: CacheSource::Database,
                    };
                }
            }
        }

        self.fetch_with_fallback(resource, network).await
    }

    /// Drop the cached copy of a resource from every tier
    pub async fn invalidate(&self, resource: &Resource) -> Result<bool> {
        let key = resource.cache_key();
        let removed = match self.store.delete(resource.collection(), &key).await {
            Ok(removed) => removed,
            Err(e) if e.is_recoverable() => {
                warn!(key = %key, error = %e, "Invalidate skipped database");
                false
            }
            Err(e) => return Err(e),
        };
        let backup_removed = self.backup.remove(&api_cache_key(&key)).unwrap_or(false);

        let cover_removed = match (&resource.kind, &resource.id) {
            (ResourceKind::AlbumArt, Some(id)) => self.covers.delete(id).await?,
            _ => false,
        };

        self.events.emit(CacheEvent::Invalidated { key });
        Ok(removed || backup_removed || cover_removed)
    }

    /// Empty every collection and every application backup key
    pub async fn clear_all(&self) -> Result<ClearReport> {
        let mut report = ClearReport::default();

        for collection in self.store.collections().await? {
            match self.store.clear(&collection).await {
                Ok(removed) => report.records_removed += removed,
                Err(e) => warn!(collection = %collection, error = %e, "Failed to clear collection"),
            }
        }

        for key in self.backup.keys()?.into_iter().filter(|k| is_app_key(k)) {
            if self.backup.remove(&key).unwrap_or(false) {
                report.backup_keys_removed += 1;
            }
        }

        info!(
            records = report.records_removed,
            backup_keys = report.backup_keys_removed,
            "Cache cleared"
        );
        self.events.emit(CacheEvent::Cleared {
            records_removed: report.records_removed,
            backup_keys_removed: report.backup_keys_removed,
        });
        Ok(report)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn skip_network(&self) -> bool {
        !self.connectivity.is_online() && self.preferences.offline_mode()
    }

    async fn read_cached(
        &self,
        resource: &Resource,
        key: &str,
        ttl: Duration,
        require_fresh: bool,
    ) -> FetchOutcome {
        let now = Utc::now();
        let mut stale_rejected = false;

        match self.store.get(resource.collection(), key).await {
            Ok(Some(record)) => {
                let stale = record.freshness_with(Some(ttl), now).is_stale();
                if stale && require_fresh {
                    stale_rejected = true;
                } else if let Some(value) = record.payload.into_json() {
                    return self.served(key, value, stale, CacheSource::Database);
                }
            }
            Ok(None) => debug!(key, "Database miss"),
            Err(e) => debug!(key, error = %e, "Database read failed, trying backup store"),
        }

        if let Some((value, stale)) = self.read_envelope(key, ttl) {
            if stale && require_fresh {
                stale_rejected = true;
            } else {
                return self.served(key, value, stale, CacheSource::Backup);
            }
        }

        if let (ResourceKind::AlbumArt, Some(id)) = (&resource.kind, &resource.id) {
            if let Some((url, stale)) = self.covers.backup_url(id) {
                if stale && require_fresh {
                    stale_rejected = true;
                } else {
                    let value = json!({"success": true, "album_art": url});
                    return self.served(key, value, stale, CacheSource::Backup);
                }
            }
        }

        self.metrics.record(&self.metrics.offline);
        self.events.emit(CacheEvent::Offline {
            key: key.to_string(),
            stale_rejected,
        });
        warn!(key, stale_rejected, "No usable data in any tier");
        FetchOutcome::Offline(OfflineNoData {
            key: key.to_string(),
            stale_rejected,
            reason: "network unavailable and no cached copy".to_string(),
        })
    }

    fn read_envelope(&self, key: &str, ttl: Duration) -> Option<(Value, bool)> {
        let raw = match self.backup.get(&api_cache_key(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!(key, error = %e, "Backup store read failed");
                return None;
            }
        };
        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key, error = %e, "Unreadable backup envelope");
                return None;
            }
        };
        let age_ms = Utc::now().timestamp_millis() - envelope.timestamp;
        let stale = age_ms > 0 && age_ms as u128 > ttl.as_millis();
        Some((envelope.data, stale))
    }

    fn served(&self, key: &str, value: Value, stale: bool, source: CacheSource) -> FetchOutcome {
        let (counter, tier) = match source {
            CacheSource::Database => (&self.metrics.database_hits, CacheTier::Database),
            CacheSource::Backup => (&self.metrics.backup_hits, CacheTier::Backup),
        };
        self.metrics.record(counter);
        if stale {
            self.metrics.record(&self.metrics.stale_served);
        }
        debug!(key, %tier, stale, "Served from cache");
        self.events.emit(CacheEvent::served(key, tier, stale));
        FetchOutcome::Cached {
            value,
            stale,
            source,
        }
    }

    /// Best-effort write; failures are logged and never reach the caller
    async fn write_through(&self, resource: &Resource, key: &str, value: &Value, ttl: Duration) {
        if !resource.is_cacheable(value) {
            debug!(key, "Response not cacheable");
            return;
        }
        if let Some(toggle) = resource.kind.toggle() {
            if !self.preferences.allows(toggle) {
                debug!(key, ?toggle, "Caching disabled by preference");
                return;
            }
        }

        let record = Record::json(key, value.clone(), Some(ttl));
        if let Err(e) = self.store.put(resource.collection(), record).await {
            warn!(key, error = %e, "Database write failed, degrading to backup store");
            self.events
                .emit(CacheEvent::write_failed(key, CacheTier::Database, &e));
            self.write_envelope(key, value, ttl);
        }

        if resource.kind == ResourceKind::AlbumArt {
            self.spawn_cover_pass(resource, value);
        }
    }

    fn write_envelope(&self, key: &str, value: &Value, ttl: Duration) {
        let envelope = Envelope::new(key, value.clone(), Some(ttl.as_millis() as u64));
        let written = serde_json::to_string(&envelope)
            .map_err(Error::from)
            .and_then(|raw| self.backup.set(&api_cache_key(key), &raw));

        match written {
            Ok(()) => {
                self.metrics.record(&self.metrics.backup_writes);
                self.events.emit(CacheEvent::BackupWrite {
                    key: key.to_string(),
                });
            }
            Err(e) => {
                self.metrics.record(&self.metrics.write_failures);
                if e.disposition() == Disposition::Swallow {
                    warn!(key, error = %e, "Backup store full, dropping write");
                } else {
                    warn!(key, error = %e, "Backup store write failed");
                }
                self.events
                    .emit(CacheEvent::write_failed(key, CacheTier::Backup, &e));
            }
        }
    }

    fn spawn_cover_pass(&self, resource: &Resource, value: &Value) {
        let Some(url) = value.get("album_art").and_then(Value::as_str) else {
            return;
        };
        if url.starts_with("data:") {
            return;
        }
        let id = resource.id.clone().unwrap_or_else(|| resource.cache_key());
        let url = url.to_string();
        let covers = self.covers.clone();
        self.background.spawn(async move {
            covers.store(&id, &url).await;
        });
    }
}
