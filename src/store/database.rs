//! Database
//!
//! Concrete [`ObjectStore`] over a set of collections. Each collection sits
//! behind its own async lock; persisting a write holds only that lock.

use crate::error::{Error, Result};
use crate::events::{CacheEvent, EventBus};
use crate::store::collection::{Collection, IndexPosition, KeyRange, ScanDirection};
use crate::store::migrator::{MigrationReport, SchemaMigrator};
use crate::store::persist::{DatabaseMeta, DiskLayout, StorageBackend};
use crate::store::record::Record;
use crate::store::schema::{Schema, DATABASE_NAME};
use crate::store::{ObjectStore, RecordCursor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for opening a database
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database name written into the header
    pub name: String,
    /// Where data lives
    pub backend: StorageBackend,
    /// Layout and version the code expects
    pub schema: Schema,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: DATABASE_NAME.to_string(),
            backend: StorageBackend::InMemory,
            schema: Schema::music_library(),
        }
    }
}

impl DatabaseConfig {
    pub fn in_directory(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Directory(path.into()),
            ..Default::default()
        }
    }

    /// Request a different schema version with the same layout
    pub fn with_version(mut self, version: u32) -> Self {
        self.schema = self.schema.at_version(version);
        self
    }
}

/// Full dump of every collection
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseExport {
    pub export_time: DateTime<Utc>,
    pub version: u32,
    pub stores: BTreeMap<String, Vec<Record>>,
}

type SharedCollection = Arc<RwLock<Collection>>;

// =============================================================================
// Database
// =============================================================================

/// Versioned collection store
pub struct Database {
    name: String,
    version: u32,
    layout: DiskLayout,
    collections: DashMap<String, SharedCollection>,
    available: Arc<AtomicBool>,
    recovered_from: Option<u32>,
    migration: MigrationReport,
}

impl Database {
    /// Open a database, recreating it when the stored version is newer
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with_events(config, &EventBus::default()).await
    }

    /// Open a database, reporting destructive recovery on `events`
    pub async fn open_with_events(config: DatabaseConfig, events: &EventBus) -> Result<Self> {
        Self::open_inner(config, false, events).await
    }

    /// Open a database, failing with [`Error::SchemaConflict`] on a downgrade
    pub async fn open_strict(config: DatabaseConfig) -> Result<Self> {
        Self::open_inner(config, true, &EventBus::default()).await
    }

    async fn open_inner(config: DatabaseConfig, strict: bool, events: &EventBus) -> Result<Self> {
        let DatabaseConfig {
            name,
            backend,
            schema,
        } = config;
        let requested = schema.version;
        let layout = DiskLayout::new(&backend);

        let meta = layout
            .read_meta()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("reading header of {}: {}", name, e)))?;

        let mut recovered_from = None;
        let mut stored = meta.map(|m| m.version).unwrap_or(0);

        if stored > requested {
            if strict {
                return Err(Error::SchemaConflict { stored, requested });
            }
            warn!(
                database = %name,
                stored,
                requested,
                "Stored schema is newer than requested; destroying and recreating database (cached data lost)"
            );
            layout
                .destroy()
                .await
                .map_err(|e| Error::StoreUnavailable(format!("destroying {}: {}", name, e)))?;
            events.emit(CacheEvent::StoreRecreated {
                name: name.clone(),
                stored,
                requested,
            });
            recovered_from = Some(stored);
            stored = 0;
        }

        let mut loaded = HashMap::new();
        let files = layout
            .read_collections()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("loading {}: {}", name, e)))?;
        for file in files {
            let collection_name = file.schema.name.clone();
            match Collection::from_file(file) {
                Ok(collection) => {
                    loaded.insert(collection_name, collection);
                }
                Err(e) => {
                    warn!(collection = %collection_name, error = %e, "Dropping unloadable collection");
                }
            }
        }

        let migration = SchemaMigrator::new(&schema)
            .run(&mut loaded, stored, &layout)
            .await;
        if let Some(version) = migration.failed_step {
            events.emit(CacheEvent::MigrationStepFailed {
                version,
                reason: format!("stopped at v{}", migration.reached),
            });
        }

        layout
            .write_meta(&DatabaseMeta {
                name: name.clone(),
                version: migration.reached,
            })
            .await
            .map_err(|e| Error::StoreUnavailable(format!("writing header of {}: {}", name, e)))?;

        info!(
            database = %name,
            version = migration.reached,
            collections = loaded.len(),
            durable = layout.is_durable(),
            "Database opened"
        );

        let collections = loaded
            .into_iter()
            .map(|(k, v)| (k, Arc::new(RwLock::new(v))))
            .collect();

        Ok(Self {
            name,
            version: migration.reached,
            layout,
            collections,
            available: Arc::new(AtomicBool::new(true)),
            recovered_from,
            migration,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema version the database is at
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Stored version that forced a recreate during open, if any
    pub fn recovered_from(&self) -> Option<u32> {
        self.recovered_from
    }

    /// What the migrator did during open
    pub fn migration(&self) -> &MigrationReport {
        &self.migration
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Check if available
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Dump every collection
    pub async fn export(&self) -> Result<DatabaseExport> {
        let mut stores = BTreeMap::new();
        for name in self.collection_names() {
            stores.insert(name.clone(), self.get_all(&name).await?);
        }
        Ok(DatabaseExport {
            export_time: Utc::now(),
            version: self.version,
            stores,
        })
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn collection(&self, name: &str) -> Result<SharedCollection> {
        self.ensure_available()?;
        self.collections
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::CollectionNotFound {
                collection: name.to_string(),
            })
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(format!("{} is unavailable", self.name)))
        }
    }

    async fn persist(layout: &DiskLayout, collection: &Collection) -> Result<()> {
        if !layout.is_durable() {
            return Ok(());
        }
        layout
            .write_collection(&collection.to_file())
            .await
            .map_err(|e| Error::StoreUnavailable(format!("persisting {}: {}", collection.name(), e)))
    }
}

#[async_trait]
impl ObjectStore for Database {
    async fn put(&self, collection: &str, record: Record) -> Result<()> {
        record.validate().map_err(|reason| Error::InvalidRecord {
            key: record.key.clone(),
            reason,
        })?;

        let shared = self.collection(collection)?;
        let mut guard = shared.write().await;
        let key = record.key.clone();
        let previous = guard.put(record)?;

        if let Err(e) = Self::persist(&self.layout, &guard).await {
            // Roll the collection back to what is on disk
            match previous {
                Some(old) => {
                    let _ = guard.put(old);
                }
                None => {
                    guard.delete(&key);
                }
            }
            return Err(e);
        }

        debug!(collection, key = %key, "Record stored");
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>> {
        let shared = self.collection(collection)?;
        let guard = shared.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let shared = self.collection(collection)?;
        let guard = shared.read().await;
        Ok(guard.values().cloned().collect())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let shared = self.collection(collection)?;
        let mut guard = shared.write().await;
        let Some(removed) = guard.delete(key) else {
            return Ok(false);
        };

        if let Err(e) = Self::persist(&self.layout, &guard).await {
            let _ = guard.put(removed);
            return Err(e);
        }
        Ok(true)
    }

    async fn scan_by_index(
        &self,
        collection: &str,
        index: &str,
        range: KeyRange,
        direction: ScanDirection,
    ) -> Result<Box<dyn RecordCursor>> {
        let shared = self.collection(collection)?;
        if !shared.read().await.has_index(index) {
            return Err(Error::IndexNotFound {
                collection: collection.to_string(),
                index: index.to_string(),
            });
        }

        Ok(Box::new(IndexCursor {
            collection: shared,
            layout: self.layout.clone(),
            available: Arc::clone(&self.available),
            index: index.to_string(),
            range,
            direction,
            position: None,
            current: None,
            dirty: false,
            exhausted: false,
        }))
    }

    async fn clear(&self, collection: &str) -> Result<u64> {
        let shared = self.collection(collection)?;
        let mut guard = shared.write().await;
        let snapshot = self.layout.is_durable().then(|| (*guard).clone());
        let removed = guard.clear();

        if let Err(e) = Self::persist(&self.layout, &guard).await {
            if let Some(previous) = snapshot {
                *guard = previous;
            }
            return Err(e);
        }
        Ok(removed)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let shared = self.collection(collection)?;
        let count = shared.read().await.len() as u64;
        Ok(count)
    }

    async fn collections(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.collection_names())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.is_available())
    }
}

// =============================================================================
// Index Cursor
// =============================================================================

/// Cursor that re-seeks the index on each step, so concurrent writers are seen
struct IndexCursor {
    collection: SharedCollection,
    layout: DiskLayout,
    available: Arc<AtomicBool>,
    index: String,
    range: KeyRange,
    direction: ScanDirection,
    position: Option<IndexPosition>,
    current: Option<String>,
    dirty: bool,
    exhausted: bool,
}

impl IndexCursor {
    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("cursor store is unavailable".to_string()))
        }
    }
}

#[async_trait]
impl RecordCursor for IndexCursor {
    async fn next(&mut self) -> Result<Option<Record>> {
        if self.exhausted {
            return Ok(None);
        }
        self.ensure_available()?;

        let found = {
            let guard = self.collection.read().await;
            let mut after = self.position.clone();
            loop {
                match guard.next_position(&self.index, &self.range, self.direction, after.as_ref())? {
                    Some(position) => {
                        if let Some(record) = guard.get(&position.1) {
                            break Some((position, record.clone()));
                        }
                        after = Some(position);
                    }
                    None => break None,
                }
            }
        };

        match found {
            Some((position, record)) => {
                self.current = Some(position.1.clone());
                self.position = Some(position);
                Ok(Some(record))
            }
            None => {
                self.exhausted = true;
                self.current = None;
                self.finish().await?;
                Ok(None)
            }
        }
    }

    async fn delete_current(&mut self) -> Result<bool> {
        self.ensure_available()?;
        let Some(key) = self.current.take() else {
            return Ok(false);
        };
        let removed = self.collection.write().await.delete(&key).is_some();
        self.dirty |= removed;
        Ok(removed)
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let guard = self.collection.read().await;
        Database::persist(&self.layout, &guard).await?;
        self.dirty = false;
        Ok(())
    }
}

// =============================================================================
// Database Handle
// =============================================================================

/// Lazily opened, shared database
///
/// The first operation opens the database; a failed open is retried by the
/// next caller instead of being remembered.
pub struct DatabaseHandle {
    config: DatabaseConfig,
    events: EventBus,
    cell: OnceCell<Arc<Database>>,
}

impl DatabaseHandle {
    pub fn new(config: DatabaseConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already opened database
    pub fn from_database(database: Arc<Database>) -> Self {
        Self {
            config: DatabaseConfig::default(),
            events: EventBus::default(),
            cell: OnceCell::from(database),
        }
    }

    /// Open on first use
    pub async fn database(&self) -> Result<Arc<Database>> {
        let database = self
            .cell
            .get_or_try_init(|| async {
                Database::open_with_events(self.config.clone(), &self.events)
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|e| match e {
                Error::StoreUnavailable(_) => e,
                other => Error::StoreUnavailable(other.to_string()),
            })?;
        Ok(Arc::clone(database))
    }

    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }
}

#[async_trait]
impl ObjectStore for DatabaseHandle {
    async fn put(&self, collection: &str, record: Record) -> Result<()> {
        self.database().await?.put(collection, record).await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>> {
        self.database().await?.get(collection, key).await
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        self.database().await?.get_all(collection).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        self.database().await?.delete(collection, key).await
    }

    async fn scan_by_index(
        &self,
        collection: &str,
        index: &str,
        range: KeyRange,
        direction: ScanDirection,
    ) -> Result<Box<dyn RecordCursor>> {
        self.database()
            .await?
            .scan_by_index(collection, index, range, direction)
            .await
    }

    async fn clear(&self, collection: &str) -> Result<u64> {
        self.database().await?.clear(collection).await
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.database().await?.count(collection).await
    }

    async fn collections(&self) -> Result<Vec<String>> {
        self.database().await?.collections().await
    }

    async fn health_check(&self) -> Result<bool> {
        match self.database().await {
            Ok(db) => db.health_check().await,
            Err(_) => Ok(false),
        }
    }
}
