//! Cover Binary Cache
//!
//! Downloads cover images, stores the raw bytes next to a `data:` URI and
//! keeps the source URL on every record. When the download fails only the URL
//! and its write time go to the backup store.

use crate::backup::{cover_time_key, cover_url_key, BackupStore, SharedBackupStore};
use crate::error::Result;
use crate::events::{CacheEvent, EventBus};
use crate::network::{with_timeout, SharedFetcher};
use crate::store::record::{Payload, Record};
use crate::store::schema::STORE_COVERS;
use crate::store::{ObjectStore, SharedObjectStore};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Where a resolved cover came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverSource {
    /// Precomputed data URI in the database
    DataUri,
    /// Data URI re-derived from stored bytes
    Bytes,
    /// Source URL kept on the database record
    SourceUrl,
    /// URL from the backup store
    BackupUrl,
}

/// Renderable cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCover {
    pub uri: String,
    pub source: CoverSource,
    pub stale: bool,
}

/// Result of a cover store pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverStoreOutcome {
    Stored { size_bytes: u64 },
    UrlOnly,
    Failed,
}

/// Download-and-store pass for cover binaries
#[derive(Clone)]
pub struct CoverCache {
    store: SharedObjectStore,
    backup: SharedBackupStore,
    fetcher: SharedFetcher,
    ttl: Duration,
    timeout: Duration,
    events: EventBus,
}

impl CoverCache {
    pub fn new(
        store: SharedObjectStore,
        backup: SharedBackupStore,
        fetcher: SharedFetcher,
        ttl: Duration,
        timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            backup,
            fetcher,
            ttl,
            timeout,
            events,
        }
    }

    /// Download `url` and cache it under `id`; never fails
    pub async fn store(&self, id: &str, url: &str) -> CoverStoreOutcome {
        let fetched = with_timeout(url, self.timeout, self.fetcher.fetch_bytes(url)).await;

        let reason = match fetched {
            Ok(body) => {
                let size_bytes = body.bytes.len() as u64;
                let record = Record::binary(id, body.bytes, body.content_type, url, Some(self.ttl));
                match self.store.put(STORE_COVERS, record).await {
                    Ok(()) => {
                        debug!(id, size_bytes, "Cover cached");
                        self.events.emit(CacheEvent::CoverStored {
                            id: id.to_string(),
                            size_bytes,
                        });
                        return CoverStoreOutcome::Stored { size_bytes };
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        warn!(id, url, error = %reason, "Cover download or store failed, keeping URL only");
        self.events.emit(CacheEvent::CoverUrlOnly {
            id: id.to_string(),
            reason: reason.to_string(),
        });
        match self.store_url(id, url, Utc::now()) {
            Ok(()) => CoverStoreOutcome::UrlOnly,
            Err(e) => {
                warn!(id, error = %e, "Cover URL backup failed");
                CoverStoreOutcome::Failed
            }
        }
    }

    /// Keep only the source URL and its write time in the backup store
    pub fn store_url(&self, id: &str, url: &str, at: DateTime<Utc>) -> Result<()> {
        self.backup.set(&cover_url_key(id), url)?;
        self.backup.set(&cover_time_key(id), &at.to_rfc3339())
    }

    /// URL from the backup store and whether it is past the TTL
    ///
    /// A URL without a readable write time counts as stale.
    pub fn backup_url(&self, id: &str) -> Option<(String, bool)> {
        let url = match self.backup.get(&cover_url_key(id)) {
            Ok(Some(url)) if !url.is_empty() => url,
            Ok(_) => return None,
            Err(e) => {
                debug!(id, error = %e, "Backup store read failed");
                return None;
            }
        };
        let written = self
            .backup
            .get(&cover_time_key(id))
            .ok()
            .flatten()
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc));

        let stale = match written {
            Some(at) => Utc::now()
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > self.ttl)
                .unwrap_or(false),
            None => true,
        };
        Some((url, stale))
    }

    /// Best renderable form of a cover
    pub async fn resolve(&self, id: &str) -> Option<ResolvedCover> {
        match self.store.get(STORE_COVERS, id).await {
            Ok(Some(record)) => {
                let source = match &record.payload {
                    Payload::Binary { data_uri: Some(_), .. } => CoverSource::DataUri,
                    Payload::Binary { bytes, .. } if !bytes.is_empty() => CoverSource::Bytes,
                    _ => CoverSource::SourceUrl,
                };
                if let Some(uri) = record.renderable() {
                    return Some(ResolvedCover {
                        uri,
                        source,
                        stale: record.freshness_at(Utc::now()).is_stale(),
                    });
                }
            }
            Ok(None) => {}
            Err(e) => debug!(id, error = %e, "Cover lookup fell back to backup store"),
        }

        self.backup_url(id).map(|(uri, stale)| ResolvedCover {
            uri,
            source: CoverSource::BackupUrl,
            stale,
        })
    }

    /// Drop every cached form of a cover (metadata re-match)
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = match self.store.delete(STORE_COVERS, id).await {
            Ok(removed) => removed,
            Err(e) if e.is_recoverable() => {
                warn!(id, error = %e, "Cover delete skipped database");
                false
            }
            Err(e) => return Err(e),
        };
        let url_removed = match self.backup.remove(&cover_url_key(id)) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(id, error = %e, "Failed to remove backup cover URL");
                false
            }
        };
        if let Err(e) = self.backup.remove(&cover_time_key(id)) {
            warn!(id, error = %e, "Failed to remove backup cover time");
        }
        Ok(removed || url_removed)
    }
}

impl std::fmt::Debug for CoverCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverCache")
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::QuotaBackupStore;
    use crate::store::{Database, DatabaseConfig};
    use crate::testing::StaticFetcher;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    const DAY: Duration = Duration::from_secs(86_400);

    async fn fixture(fetcher: StaticFetcher) -> (CoverCache, Arc<Database>, Arc<QuotaBackupStore>) {
        let db = Arc::new(Database::open(DatabaseConfig::default()).await.unwrap());
        let backup = Arc::new(QuotaBackupStore::new());
        let cache = CoverCache::new(
            db.clone(),
            backup.clone(),
            Arc::new(fetcher),
            30 * DAY,
            Duration::from_millis(200),
            EventBus::default(),
        );
        (cache, db, backup)
    }

    #[tokio::test]
    async fn test_store_keeps_bytes_and_source() {
        let fetcher = StaticFetcher::new().with("http://h/a.jpg", b"jpeg", Some("image/jpeg"));
        let (cache, db, _) = fixture(fetcher).await;

        assert_matches!(
            cache.store("a.mp3", "http://h/a.jpg").await,
            CoverStoreOutcome::Stored { size_bytes: 4 }
        );
        let record = db.get(STORE_COVERS, "a.mp3").await.unwrap().unwrap();
        assert_eq!(record.source_url.as_deref(), Some("http://h/a.jpg"));

        let resolved = cache.resolve("a.mp3").await.unwrap();
        assert_eq!(resolved.source, CoverSource::DataUri);
        assert!(resolved.uri.starts_with("data:image/jpeg;base64,"));
        assert!(!resolved.stale);
    }

    #[tokio::test]
    async fn test_download_failure_keeps_url_only() {
        let (cache, db, backup) = fixture(StaticFetcher::new()).await;

        assert_eq!(
            cache.store("b.mp3", "http://h/missing.jpg").await,
            CoverStoreOutcome::UrlOnly
        );
        assert_eq!(db.count(STORE_COVERS).await.unwrap(), 0);
        assert_eq!(
            backup.get(&cover_url_key("b.mp3")).unwrap().as_deref(),
            Some("http://h/missing.jpg")
        );

        let resolved = cache.resolve("b.mp3").await.unwrap();
        assert_eq!(resolved.source, CoverSource::BackupUrl);
        assert!(!resolved.stale);
    }

    #[tokio::test]
    async fn test_slow_download_times_out() {
        let fetcher = StaticFetcher::new()
            .with("http://h/slow.jpg", b"x", None)
            .delayed(Duration::from_secs(5));
        let (cache, _, backup) = fixture(fetcher).await;
        assert_eq!(cache.store("s", "http://h/slow.jpg").await, CoverStoreOutcome::UrlOnly);
        assert!(backup.get(&cover_url_key("s")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolve_rederives_and_falls_back_to_source() {
        let (cache, db, _) = fixture(StaticFetcher::new()).await;
        let mut record = Record::binary("c", Bytes::from_static(b"abc"), None, "http://h/c.jpg", None);
        if let Payload::Binary { data_uri, .. } = &mut record.payload {
            *data_uri = None;
        }
        db.put(STORE_COVERS, record.clone()).await.unwrap();
        assert_eq!(cache.resolve("c").await.unwrap().source, CoverSource::Bytes);

        if let Payload::Binary { bytes, .. } = &mut record.payload {
            *bytes = Bytes::new();
        }
        db.put(STORE_COVERS, record).await.unwrap();
        let resolved = cache.resolve("c").await.unwrap();
        assert_eq!(resolved.source, CoverSource::SourceUrl);
        assert_eq!(resolved.uri, "http://h/c.jpg");
    }

    #[tokio::test]
    async fn test_backup_url_staleness() {
        let (cache, _, backup) = fixture(StaticFetcher::new()).await;
        cache
            .store_url("old", "http://h/o.jpg", Utc::now() - ChronoDuration::days(31))
            .unwrap();
        assert_eq!(cache.backup_url("old"), Some(("http://h/o.jpg".to_string(), true)));

        backup.set(&cover_url_key("untimed"), "http://h/u.jpg").unwrap();
        assert!(cache.backup_url("untimed").unwrap().1);
        assert_eq!(cache.backup_url("absent"), None);
    }

    #[tokio::test]
    async fn test_delete_drops_every_form() {
        let fetcher = StaticFetcher::new().with("http://h/d.jpg", b"d", None);
        let (cache, db, backup) = fixture(fetcher).await;
        cache.store("d", "http://h/d.jpg").await;
        cache.store_url("d", "http://h/d.jpg", Utc::now()).unwrap();

        assert!(cache.delete("d").await.unwrap());
        assert_eq!(db.get(STORE_COVERS, "d").await.unwrap(), None);
        assert_eq!(backup.get(&cover_url_key("d")).unwrap(), None);
        assert_eq!(backup.get(&cover_time_key("d")).unwrap(), None);
        assert!(cache.resolve("d").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_survives_unavailable_backup() {
        let fetcher = StaticFetcher::new().with("http://h/e.jpg", b"e", None);
        let (cache, db, backup) = fixture(fetcher).await;
        cache.store("e", "http://h/e.jpg").await;
        cache.store_url("e", "http://h/e.jpg", Utc::now()).unwrap();

        backup.set_available(false);
        assert!(cache.delete("e").await.unwrap());
        assert_eq!(db.get(STORE_COVERS, "e").await.unwrap(), None);

        backup.set_available(true);
        assert!(backup.get(&cover_url_key("e")).unwrap().is_some());
        assert!(backup.get(&cover_time_key("e")).unwrap().is_some());
    }
}
