//! In-Memory Collection
//!
//! A collection's records keyed by primary key, plus one ordered set per
//! secondary index. Index entries are `(index key, primary key)` pairs so
//! duplicate index values stay distinct and ordering is total.

use crate::error::{Error, Result};
use crate::store::record::Record;
use crate::store::schema::{CollectionSchema, IndexKey, IndexSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Position of a record within an index
pub type IndexPosition = (IndexKey, String);

// =============================================================================
// Key Range
// =============================================================================

/// Bounds on index keys for a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<IndexKey>,
    pub upper: Bound<IndexKey>,
}

impl KeyRange {
    /// Every key
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Keys below `key` (`open` excludes `key` itself)
    pub fn upper_bound(key: IndexKey, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: if open {
                Bound::Excluded(key)
            } else {
                Bound::Included(key)
            },
        }
    }

    /// Keys above `key` (`open` excludes `key` itself)
    pub fn lower_bound(key: IndexKey, open: bool) -> Self {
        Self {
            lower: if open {
                Bound::Excluded(key)
            } else {
                Bound::Included(key)
            },
            upper: Bound::Unbounded,
        }
    }

    /// Exactly one key
    pub fn only(key: IndexKey) -> Self {
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        self.above_lower(key) && self.below_upper(key)
    }

    fn above_lower(&self, key: &IndexKey) -> bool {
        match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
        }
    }

    fn below_upper(&self, key: &IndexKey) -> bool {
        match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Scan order over an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Ascending,
    Descending,
}

// =============================================================================
// Collection
// =============================================================================

/// On-disk form of a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionFile {
    pub schema: CollectionSchema,
    pub records: Vec<Record>,
}

/// A named set of records with secondary indexes
#[derive(Debug, Clone)]
pub struct Collection {
    schema: CollectionSchema,
    records: BTreeMap<String, Record>,
    indexes: HashMap<String, BTreeSet<IndexPosition>>,
}

impl Collection {
    /// Create an empty collection with the schema's indexes
    pub fn new(schema: CollectionSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|i| (i.name.clone(), BTreeSet::new()))
            .collect();
        Self {
            schema,
            records: BTreeMap::new(),
            indexes,
        }
    }

    /// Rebuild a collection from its on-disk form
    pub fn from_file(file: CollectionFile) -> Result<Self> {
        let mut collection = Self::new(file.schema);
        for record in file.records {
            collection.put(record)?;
        }
        Ok(collection)
    }

    /// Snapshot for persistence
    pub fn to_file(&self) -> CollectionFile {
        CollectionFile {
            schema: self.schema.clone(),
            records: self.records.values().cloned().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Upsert a record, returning the replaced one
    pub fn put(&mut self, record: Record) -> Result<Option<Record>> {
        self.check_unique(&record)?;

        let previous = self.records.remove(&record.key);
        if let Some(old) = &previous {
            self.unindex(old);
        }
        self.index(&record);
        self.records.insert(record.key.clone(), record);
        Ok(previous)
    }

    /// Remove a record by key
    pub fn delete(&mut self, key: &str) -> Option<Record> {
        let removed = self.records.remove(key)?;
        self.unindex(&removed);
        Some(removed)
    }

    /// Remove every record, returning how many were dropped
    pub fn clear(&mut self) -> u64 {
        let count = self.records.len() as u64;
        self.records.clear();
        for set in self.indexes.values_mut() {
            set.clear();
        }
        count
    }

    /// Add an index, filing every existing record under it
    pub fn add_index(&mut self, spec: IndexSpec) -> Result<()> {
        if self.has_index(&spec.name) {
            return Ok(());
        }
        let mut set = BTreeSet::new();
        for record in self.records.values() {
            if let Some(key) = spec.extract(record) {
                if spec.unique && set.iter().any(|(k, _): &IndexPosition| k == &key) {
                    return Err(Error::ConstraintViolation {
                        collection: self.schema.name.clone(),
                        index: spec.name.clone(),
                        existing: record.key.clone(),
                    });
                }
                set.insert((key, record.key.clone()));
            }
        }
        self.indexes.insert(spec.name.clone(), set);
        self.schema.indexes.push(spec);
        Ok(())
    }

    /// Next position in `index` strictly after `after`, within `range`
    pub fn next_position(
        &self,
        index: &str,
        range: &KeyRange,
        direction: ScanDirection,
        after: Option<&IndexPosition>,
    ) -> Result<Option<IndexPosition>> {
        let set = self.indexes.get(index).ok_or_else(|| Error::IndexNotFound {
            collection: self.schema.name.clone(),
            index: index.to_string(),
        })?;

        let found = match direction {
            ScanDirection::Ascending => {
                let start = match after {
                    Some(pos) => Bound::Excluded(pos.clone()),
                    None => Bound::Unbounded,
                };
                set.range((start, Bound::Unbounded))
                    .find(|(k, _)| range.above_lower(k))
                    .filter(|(k, _)| range.below_upper(k))
            }
            ScanDirection::Descending => {
                let end = match after {
                    Some(pos) => Bound::Excluded(pos.clone()),
                    None => Bound::Unbounded,
                };
                set.range((Bound::Unbounded, end))
                    .rev()
                    .find(|(k, _)| range.below_upper(k))
                    .filter(|(k, _)| range.above_lower(k))
            }
        };

        Ok(found.cloned())
    }

    fn index(&mut self, record: &Record) {
        for spec in &self.schema.indexes {
            if let Some(key) = spec.extract(record) {
                if let Some(set) = self.indexes.get_mut(&spec.name) {
                    set.insert((key, record.key.clone()));
                }
            }
        }
    }

    fn unindex(&mut self, record: &Record) {
        for spec in &self.schema.indexes {
            if let Some(key) = spec.extract(record) {
                if let Some(set) = self.indexes.get_mut(&spec.name) {
                    set.remove(&(key, record.key.clone()));
                }
            }
        }
    }

    fn check_unique(&self, record: &Record) -> Result<()> {
        for spec in self.schema.indexes.iter().filter(|s| s.unique) {
            let Some(key) = spec.extract(record) else {
                continue;
            };
            let Some(set) = self.indexes.get(&spec.name) else {
                continue;
            };
            let clash = set
                .range((
                    Bound::Included((key.clone(), String::new())),
                    Bound::Unbounded,
                ))
                .take_while(|(k, _)| k == &key)
                .find(|(_, owner)| owner != &record.key);
            if let Some((_, owner)) = clash {
                return Err(Error::ConstraintViolation {
                    collection: self.schema.name.clone(),
                    index: spec.name.clone(),
                    existing: owner.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn aged(key: &str, days: i64) -> Record {
        Record::json(key, json!({"key": key}), None)
            .cached_at(Utc::now() - ChronoDuration::days(days))
    }

    fn collection() -> Collection {
        Collection::new(CollectionSchema::new("lyrics").index(IndexSpec::age()))
    }

    #[test]
    fn test_upsert_keeps_one_record() {
        let mut c = collection();
        c.put(aged("a", 3)).unwrap();
        let replaced = c.put(aged("a", 1)).unwrap();
        assert!(replaced.is_some());
        assert_eq!(c.len(), 1);

        // Old index entry is gone, only the new one remains
        let first = c
            .next_position("cached_at", &KeyRange::all(), ScanDirection::Ascending, None)
            .unwrap()
            .unwrap();
        assert_eq!(first.1, "a");
        assert!(c
            .next_position("cached_at", &KeyRange::all(), ScanDirection::Ascending, Some(&first))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_ordered_walk_in_range() {
        let mut c = collection();
        c.put(aged("old", 40)).unwrap();
        c.put(aged("mid", 20)).unwrap();
        c.put(aged("new", 1)).unwrap();

        let cutoff = (Utc::now() - ChronoDuration::days(10)).timestamp_millis();
        let range = KeyRange::upper_bound(IndexKey::millis(cutoff), true);

        let mut seen = Vec::new();
        let mut pos = None;
        while let Some(next) = c
            .next_position("cached_at", &range, ScanDirection::Ascending, pos.as_ref())
            .unwrap()
        {
            seen.push(next.1.clone());
            pos = Some(next);
        }
        assert_eq!(seen, vec!["old", "mid"]);

        let newest = c
            .next_position("cached_at", &KeyRange::all(), ScanDirection::Descending, None)
            .unwrap()
            .unwrap();
        assert_eq!(newest.1, "new");
    }

    #[test]
    fn test_unique_index() {
        let mut c = Collection::new(
            CollectionSchema::new("covers").index(IndexSpec::new("filename", "filename").unique()),
        );
        c.put(Record::json("1", json!({"filename": "a.mp3"}), None)).unwrap();
        // Same key may rewrite its own value
        c.put(Record::json("1", json!({"filename": "a.mp3"}), None)).unwrap();

        let err = c
            .put(Record::json("2", json!({"filename": "a.mp3"}), None))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));
    }

    #[test]
    fn test_add_index_backfills() {
        let mut c = Collection::new(CollectionSchema::new("playlist_cache"));
        c.put(Record::json("fullPlaylist", json!({"type": "fullPlaylist"}), None))
            .unwrap();
        c.add_index(IndexSpec::new("type", "type")).unwrap();

        let hit = c
            .next_position(
                "type",
                &KeyRange::only(IndexKey::Text("fullPlaylist".into())),
                ScanDirection::Ascending,
                None,
            )
            .unwrap();
        assert_eq!(hit.map(|p| p.1), Some("fullPlaylist".to_string()));
    }

    #[test]
    fn test_missing_index() {
        let c = collection();
        let err = c
            .next_position("nope", &KeyRange::all(), ScanDirection::Ascending, None)
            .unwrap_err();
        assert!(matches!(err, Error::IndexNotFound { .. }));
    }

    #[test]
    fn test_file_round_trip_rebuilds_indexes() {
        let mut c = collection();
        c.put(aged("x", 2)).unwrap();
        let rebuilt = Collection::from_file(c.to_file()).unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert!(rebuilt
            .next_position("cached_at", &KeyRange::all(), ScanDirection::Ascending, None)
            .unwrap()
            .is_some());
    }
}
