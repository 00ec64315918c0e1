//! Schema Migrator
//!
//! Runs once while a database is opened. Missing collections and indexes are
//! created first, then each version step between the stored and requested
//! version runs against staged copies of the collections it touches. A step
//! either lands whole or not at all.

use crate::error::{Error, Result};
use crate::store::collection::Collection;
use crate::store::persist::DiskLayout;
use crate::store::schema::Schema;
use std::collections::HashMap;
use tracing::{debug, info, warn};

// =============================================================================
// Migration Transaction
// =============================================================================

/// Staged view of the collections a version step modifies
pub struct MigrationTxn<'a> {
    version: u32,
    live: &'a HashMap<String, Collection>,
    staged: HashMap<String, Collection>,
}

impl<'a> MigrationTxn<'a> {
    fn new(version: u32, live: &'a HashMap<String, Collection>) -> Self {
        Self {
            version,
            live,
            staged: HashMap::new(),
        }
    }

    /// Version this step upgrades to
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Read a collection as the step currently sees it
    pub fn collection(&self, name: &str) -> Result<&Collection> {
        self.staged
            .get(name)
            .or_else(|| self.live.get(name))
            .ok_or_else(|| Error::CollectionNotFound {
                collection: name.to_string(),
            })
    }

    /// Stage a collection for modification
    pub fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        if !self.staged.contains_key(name) {
            let copy = self
                .live
                .get(name)
                .cloned()
                .ok_or_else(|| Error::CollectionNotFound {
                    collection: name.to_string(),
                })?;
            self.staged.insert(name.to_string(), copy);
        }
        self.staged
            .get_mut(name)
            .ok_or_else(|| Error::Internal(format!("staged collection {} vanished", name)))
    }

    fn into_staged(self) -> HashMap<String, Collection> {
        self.staged
    }
}

// =============================================================================
// Migration Report
// =============================================================================

/// Outcome of one migrator run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version found on disk (0 for a new database)
    pub from: u32,
    /// Version requested by the code
    pub to: u32,
    /// Version actually reached
    pub reached: u32,
    pub created_collections: Vec<String>,
    pub created_indexes: Vec<String>,
    pub failed_step: Option<u32>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failed_step.is_none() && self.reached == self.to
    }
}

// =============================================================================
// Schema Migrator
// =============================================================================

/// Reconciles loaded collections with a schema
pub struct SchemaMigrator<'s> {
    schema: &'s Schema,
}

impl<'s> SchemaMigrator<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema }
    }

    /// Bring `collections` up to the schema, persisting every change
    pub async fn run(
        &self,
        collections: &mut HashMap<String, Collection>,
        from: u32,
        layout: &DiskLayout,
    ) -> MigrationReport {
        let mut report = MigrationReport {
            from,
            to: self.schema.version,
            reached: from,
            ..Default::default()
        };

        if from < self.schema.version {
            info!(from, to = self.schema.version, "Upgrading database schema");
        }

        self.ensure_layout(collections, layout, &mut report).await;

        for step in self.schema.steps_between(from) {
            let mut txn = MigrationTxn::new(step.version, collections);
            let applied = (step.apply)(&mut txn);
            let staged = txn.into_staged();

            let outcome = match applied {
                Ok(()) => Self::commit(staged, collections, layout).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(touched) => {
                    debug!(version = step.version, touched, step = step.description, "Migration step applied");
                    report.reached = step.version;
                }
                Err(e) => {
                    warn!(version = step.version, step = step.description, error = %e, "Migration step failed, rolled back");
                    report.failed_step = Some(step.version);
                    return report;
                }
            }
        }

        report.reached = report.reached.max(self.schema.version);
        report
    }

    /// Create missing collections and indexes
    async fn ensure_layout(
        &self,
        collections: &mut HashMap<String, Collection>,
        layout: &DiskLayout,
        report: &mut MigrationReport,
    ) {
        for spec in &self.schema.collections {
            let mut changed = false;

            let collection = collections.entry(spec.name.clone()).or_insert_with(|| {
                report.created_collections.push(spec.name.clone());
                changed = true;
                Collection::new(spec.clone())
            });

            for index in &spec.indexes {
                if collection.has_index(&index.name) {
                    continue;
                }
                match collection.add_index(index.clone()) {
                    Ok(()) => {
                        report
                            .created_indexes
                            .push(format!("{}.{}", spec.name, index.name));
                        changed = true;
                    }
                    Err(e) => {
                        warn!(collection = %spec.name, index = %index.name, error = %e, "Index creation failed");
                    }
                }
            }

            if changed {
                if let Err(e) = layout.write_collection(&collection.to_file()).await {
                    warn!(collection = %spec.name, error = %e, "Failed to persist collection layout");
                }
            }
        }
    }

    /// Persist staged collections, then swap them in
    async fn commit(
        staged: HashMap<String, Collection>,
        collections: &mut HashMap<String, Collection>,
        layout: &DiskLayout,
    ) -> Result<usize> {
        for collection in staged.values() {
            layout.write_collection(&collection.to_file()).await?;
        }
        let touched = staged.len();
        collections.extend(staged);
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::persist::StorageBackend;
    use crate::store::record::Record;
    use crate::store::schema::{
        CollectionSchema, IndexSpec, MigrationStep, STORE_PLAYLIST_CACHE,
    };
    use serde_json::json;

    fn layout() -> DiskLayout {
        DiskLayout::new(&StorageBackend::InMemory)
    }

    #[tokio::test]
    async fn test_fresh_database_gets_full_layout() {
        let schema = Schema::music_library();
        let mut collections = HashMap::new();
        let report = SchemaMigrator::new(&schema)
            .run(&mut collections, 0, &layout())
            .await;

        assert!(report.is_complete());
        assert_eq!(report.reached, schema.version);
        assert_eq!(report.created_collections.len(), schema.collections.len());
        assert_eq!(collections.len(), schema.collections.len());
    }

    #[tokio::test]
    async fn test_v2_backfills_playlist_type() {
        let schema = Schema::music_library();
        let mut collections = HashMap::new();
        let mut old = Collection::new(CollectionSchema::new(STORE_PLAYLIST_CACHE));
        old.put(Record::json("playlistSongs_9", json!({"data": [1, 2]}), None))
            .unwrap();
        collections.insert(STORE_PLAYLIST_CACHE.to_string(), old);

        let report = SchemaMigrator::new(&schema)
            .run(&mut collections, 1, &layout())
            .await;

        assert!(report.is_complete());
        assert!(report
            .created_indexes
            .contains(&format!("{}.type", STORE_PLAYLIST_CACHE)));
        let record = collections[STORE_PLAYLIST_CACHE].get("playlistSongs_9").unwrap();
        assert_eq!(record.payload.as_json().unwrap()["type"], "playlistSongs");
    }

    #[tokio::test]
    async fn test_failed_step_is_isolated() {
        fn write_then_fail(txn: &mut MigrationTxn) -> Result<()> {
            txn.collection_mut("a")?
                .put(Record::json("poison", json!({}), None))?;
            Err(Error::Internal("boom".into()))
        }
        fn never_runs(txn: &mut MigrationTxn) -> Result<()> {
            txn.collection_mut("a")?
                .put(Record::json("later", json!({}), None))?;
            Ok(())
        }

        let schema = Schema::new(3)
            .collection(CollectionSchema::new("a").index(IndexSpec::age()))
            .step(MigrationStep {
                version: 1,
                description: "seed",
                apply: |txn| {
                    txn.collection_mut("a")?
                        .put(Record::json("seed", json!({}), None))?;
                    Ok(())
                },
            })
            .step(MigrationStep {
                version: 2,
                description: "fails",
                apply: write_then_fail,
            })
            .step(MigrationStep {
                version: 3,
                description: "after failure",
                apply: never_runs,
            });

        let mut collections = HashMap::new();
        let report = SchemaMigrator::new(&schema)
            .run(&mut collections, 0, &layout())
            .await;

        assert_eq!(report.failed_step, Some(2));
        assert_eq!(report.reached, 1);
        assert!(!report.is_complete());

        let a = &collections["a"];
        assert!(a.get("seed").is_some());
        assert!(a.get("poison").is_none());
        assert!(a.get("later").is_none());
    }
}
