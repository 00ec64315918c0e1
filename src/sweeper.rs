//! Retention Sweeper
//!
//! Deletes records older than a per-collection window by walking the
//! collection's age index in ascending order. Each collection is swept
//! independently; one failure is logged and never stops the others.

use crate::config::RetentionConfig;
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EventBus};
use crate::store::schema::{IndexKey, AGE_INDEX};
use crate::store::{KeyRange, ObjectStore, ScanDirection, SharedObjectStore};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one sweep over one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepResult {
    pub collection: String,
    pub outcome: std::result::Result<u64, String>,
}

/// Per-collection results of a full pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub results: Vec<SweepResult>,
}

impl SweepReport {
    pub fn total_deleted(&self) -> u64 {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SweepResult> {
        self.results.iter().filter(|r| r.outcome.is_err())
    }

    pub fn deleted(&self, collection: &str) -> Option<u64> {
        self.results
            .iter()
            .find(|r| r.collection == collection)
            .and_then(|r| r.outcome.as_ref().ok().copied())
    }
}

/// Age-based cleanup over every configured collection
#[derive(Clone)]
pub struct RetentionSweeper {
    store: SharedObjectStore,
    windows: Vec<(String, Duration)>,
    events: EventBus,
}

impl RetentionSweeper {
    pub fn new(store: SharedObjectStore, retention: &RetentionConfig, events: EventBus) -> Self {
        let windows = retention
            .windows()
            .into_iter()
            .map(|(name, window)| (name.to_string(), window))
            .collect();
        Self {
            store,
            windows,
            events,
        }
    }

    /// Replace the configured windows
    pub fn with_windows(mut self, windows: Vec<(String, Duration)>) -> Self {
        self.windows = windows;
        self
    }

    /// Delete every record of `collection` written more than `max_age` ago
    pub async fn sweep(&self, collection: &str, max_age: Duration) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);

        let mut cursor = self
            .store
            .scan_by_index(
                collection,
                AGE_INDEX,
                KeyRange::upper_bound(IndexKey::millis(cutoff), true),
                ScanDirection::Ascending,
            )
            .await?;

        let mut deleted = 0;
        let walked = async {
            while cursor.next().await?.is_some() {
                if cursor.delete_current().await? {
                    deleted += 1;
                }
            }
            Ok::<(), Error>(())
        }
        .await;
        // Deletions made before a failure are still flushed
        let finished = cursor.finish().await;
        walked?;
        finished?;

        debug!(collection, deleted, "Sweep finished");
        Ok(deleted)
    }

    /// Sweep every configured collection
    pub async fn sweep_all(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (collection, window) in &self.windows {
            let outcome = match self.sweep(collection, *window).await {
                Ok(deleted) => {
                    self.events.emit(CacheEvent::Swept {
                        collection: collection.clone(),
                        deleted,
                    });
                    Ok(deleted)
                }
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Sweep failed");
                    self.events.emit(CacheEvent::SweepFailed {
                        collection: collection.clone(),
                        error: e.to_string(),
                    });
                    Err(e.to_string())
                }
            };
            report.results.push(SweepResult {
                collection: collection.clone(),
                outcome,
            });
        }

        info!(
            deleted = report.total_deleted(),
            failed = report.failures().count(),
            "Retention sweep complete"
        );
        report
    }

    /// Run `sweep_all` every `interval` until cancelled
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Retention sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_all().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::Record;
    use crate::store::schema::{STORE_COVERS, STORE_LYRICS, STORE_PLAY_HISTORY};
    use crate::store::{Database, DatabaseConfig, RecordCursor};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const DAY: Duration = Duration::from_secs(86_400);

    async fn sweeper() -> (RetentionSweeper, Arc<Database>) {
        let db = Arc::new(Database::open(DatabaseConfig::default()).await.unwrap());
        let sweeper = RetentionSweeper::new(db.clone(), &RetentionConfig::default(), EventBus::default());
        (sweeper, db)
    }

    async fn put_aged(db: &Database, collection: &str, key: &str, days: i64) {
        let record = Record::json(key, json!({}), None).cached_at(Utc::now() - ChronoDuration::days(days));
        db.put(collection, record).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_records() {
        let (sweeper, db) = sweeper().await;
        put_aged(&db, STORE_PLAY_HISTORY, "old", 120).await;
        put_aged(&db, STORE_PLAY_HISTORY, "older", 200).await;
        put_aged(&db, STORE_PLAY_HISTORY, "recent", 10).await;

        assert_eq!(sweeper.sweep(STORE_PLAY_HISTORY, 90 * DAY).await.unwrap(), 2);
        let left: Vec<_> = db
            .get_all(STORE_PLAY_HISTORY)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(left, vec!["recent".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_all_isolates_failures() {
        let (sweeper, db) = sweeper().await;
        put_aged(&db, STORE_COVERS, "c", 45).await;
        put_aged(&db, STORE_LYRICS, "l", 1).await;

        let sweeper = sweeper.with_windows(vec![
            ("missing".to_string(), DAY),
            (STORE_COVERS.to_string(), 30 * DAY),
            (STORE_LYRICS.to_string(), 30 * DAY),
        ]);
        let report = sweeper.sweep_all().await;

        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.deleted(STORE_COVERS), Some(1));
        assert_eq!(report.deleted(STORE_LYRICS), Some(0));
        assert_eq!(db.count(STORE_LYRICS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let (sweeper, db) = sweeper().await;
        put_aged(&db, STORE_COVERS, "c", 45).await;

        let cancel = CancellationToken::new();
        let handle = sweeper.spawn(Duration::from_secs(3600), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(db.count(STORE_COVERS).await.unwrap(), 0);
    }

    /// Store whose cursors fail after a fixed number of deletions
    struct FailingCursorStore {
        inner: Arc<Database>,
        deletes_before_failure: usize,
        finished: Arc<AtomicBool>,
    }

    struct FailingCursor {
        inner: Box<dyn RecordCursor>,
        deletes_left: usize,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RecordCursor for FailingCursor {
        async fn next(&mut self) -> Result<Option<Record>> {
            self.inner.next().await
        }

        async fn delete_current(&mut self) -> Result<bool> {
            if self.deletes_left == 0 {
                return Err(Error::StoreUnavailable("disk detached".into()));
            }
            self.deletes_left -= 1;
            self.inner.delete_current().await
        }

        async fn finish(&mut self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            self.inner.finish().await
        }
    }

    #[async_trait]
    impl ObjectStore for FailingCursorStore {
        async fn put(&self, collection: &str, record: Record) -> Result<()> {
            self.inner.put(collection, record).await
        }

        async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>> {
            self.inner.get(collection, key).await
        }

        async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
            self.inner.get_all(collection).await
        }

        async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
            self.inner.delete(collection, key).await
        }

        async fn scan_by_index(
            &self,
            collection: &str,
            index: &str,
            range: KeyRange,
            direction: ScanDirection,
        ) -> Result<Box<dyn RecordCursor>> {
            let inner = self.inner.scan_by_index(collection, index, range, direction).await?;
            Ok(Box::new(FailingCursor {
                inner,
                deletes_left: self.deletes_before_failure,
                finished: self.finished.clone(),
            }))
        }

        async fn clear(&self, collection: &str) -> Result<u64> {
            self.inner.clear(collection).await
        }

        async fn count(&self, collection: &str) -> Result<u64> {
            self.inner.count(collection).await
        }

        async fn collections(&self) -> Result<Vec<String>> {
            self.inner.collections().await
        }

        async fn health_check(&self) -> Result<bool> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn test_failed_sweep_still_flushes_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        {
            let db = Arc::new(Database::open(DatabaseConfig::in_directory(dir.path())).await.unwrap());
            for (key, days) in [("a", 200), ("b", 150), ("c", 120)] {
                put_aged(&db, STORE_PLAY_HISTORY, key, days).await;
            }

            let store = Arc::new(FailingCursorStore {
                inner: db,
                deletes_before_failure: 2,
                finished: finished.clone(),
            });
            let sweeper = RetentionSweeper::new(store, &RetentionConfig::default(), EventBus::default());
            assert_matches!(
                sweeper.sweep(STORE_PLAY_HISTORY, 90 * DAY).await,
                Err(Error::StoreUnavailable(_))
            );
        }
        assert!(finished.load(Ordering::SeqCst));

        let db = Database::open(DatabaseConfig::in_directory(dir.path())).await.unwrap();
        assert_eq!(db.count(STORE_PLAY_HISTORY).await.unwrap(), 1);
    }
}
