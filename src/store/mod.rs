//! Durable Object Store
//!
//! Versioned local database made of named collections. Each collection keys
//! records by a string primary key and keeps optional secondary indexes that
//! can be walked with a forward cursor. Writers lock only the collection they
//! touch, never the whole store.

mod collection;
mod database;
mod migrator;
mod persist;
pub mod record;
pub mod schema;

pub use collection::{Collection, CollectionFile, IndexPosition, KeyRange, ScanDirection};
pub use database::{Database, DatabaseConfig, DatabaseExport, DatabaseHandle};
pub use migrator::{MigrationReport, MigrationTxn, SchemaMigrator};
pub use persist::{DatabaseMeta, StorageBackend};
pub use record::{Freshness, Payload, Record};
pub use schema::{CollectionSchema, IndexKey, IndexSpec, MigrationStep, Schema};

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// ObjectStore Trait
// =============================================================================

/// Asynchronous collection-scoped CRUD and cursor access
///
/// Every operation is scoped to one collection. There is no cross-collection
/// atomicity; concurrent callers may interleave freely between collections.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upsert a record (last write wins)
    async fn put(&self, collection: &str, record: Record) -> Result<()>;

    /// Get a record by key
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>>;

    /// Get every record of a collection in key order
    async fn get_all(&self, collection: &str) -> Result<Vec<Record>>;

    /// Delete a record by key
    ///
    /// Returns whether a record was removed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool>;

    /// Open a cursor over a secondary index
    async fn scan_by_index(
        &self,
        collection: &str,
        index: &str,
        range: KeyRange,
        direction: ScanDirection,
    ) -> Result<Box<dyn RecordCursor>>;

    /// Remove every record of a collection
    async fn clear(&self, collection: &str) -> Result<u64>;

    /// Number of records in a collection
    async fn count(&self, collection: &str) -> Result<u64>;

    /// Names of every collection
    async fn collections(&self) -> Result<Vec<String>>;

    /// Check if the store is usable
    async fn health_check(&self) -> Result<bool>;
}

/// Forward cursor over an index range
///
/// Deletions through the cursor apply immediately in memory and are flushed
/// to disk when the cursor is exhausted or finished.
#[async_trait]
pub trait RecordCursor: Send {
    /// Advance to the next record
    async fn next(&mut self) -> Result<Option<Record>>;

    /// Delete the record the cursor is positioned on
    async fn delete_current(&mut self) -> Result<bool>;

    /// Flush pending deletions
    async fn finish(&mut self) -> Result<()>;
}

/// Type alias for a shared object store
pub type SharedObjectStore = Arc<dyn ObjectStore>;
