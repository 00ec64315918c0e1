//! Named response caches
//!
//! Namespaces are kept in creation order; [`CacheStorage::match_any`] searches
//! them in that order.

use super::upstream::EdgeResponse;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// One named cache keyed by request path
#[derive(Debug, Default)]
pub struct Namespace {
    entries: DashMap<String, EdgeResponse>,
}

impl Namespace {
    pub fn get(&self, key: &str) -> Option<EdgeResponse> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn put(&self, key: impl Into<String>, response: EdgeResponse) {
        self.entries.insert(key.into(), response);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every namespace the proxy owns
#[derive(Debug, Default)]
pub struct CacheStorage {
    namespaces: RwLock<IndexMap<String, Arc<Namespace>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a namespace, creating it if absent
    pub fn open(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.namespaces.read().get(name) {
            return Arc::clone(ns);
        }
        let mut namespaces = self.namespaces.write();
        Arc::clone(namespaces.entry(name.to_string()).or_default())
    }

    pub fn has(&self, name: &str) -> bool {
        self.namespaces.read().contains_key(name)
    }

    /// Drop a namespace and everything in it
    pub fn delete(&self, name: &str) -> bool {
        self.namespaces.write().shift_remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// First cached response for `key` across namespaces
    pub fn match_any(&self, key: &str) -> Option<EdgeResponse> {
        self.namespaces
            .read()
            .values()
            .find_map(|ns| ns.get(key))
    }
}
