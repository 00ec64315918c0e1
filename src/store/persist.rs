//! On-Disk Layout
//!
//! A database directory holds `meta.json` (name + schema version) and one
//! JSON file per collection under `collections/`. Every write goes to a
//! temporary file first and is renamed into place.

use crate::error::Result;
use crate::store::collection::CollectionFile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const META_FILE: &str = "meta.json";
const COLLECTIONS_DIR: &str = "collections";

/// Persisted database header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub version: u32,
}

/// Where a database keeps its data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Nothing survives the process (tests, ephemeral sessions)
    #[default]
    InMemory,
    /// Files under a directory
    Directory(PathBuf),
}

/// File operations for one database
#[derive(Debug, Clone)]
pub struct DiskLayout {
    root: Option<PathBuf>,
}

impl DiskLayout {
    pub fn new(backend: &StorageBackend) -> Self {
        let root = match backend {
            StorageBackend::InMemory => None,
            StorageBackend::Directory(path) => Some(path.clone()),
        };
        Self { root }
    }

    pub fn is_durable(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn collection_path(root: &Path, name: &str) -> PathBuf {
        root.join(COLLECTIONS_DIR)
            .join(format!("{}.json", urlencoding::encode(name)))
    }

    /// Read the header, None when the database does not exist yet
    pub async fn read_meta(&self) -> Result<Option<DatabaseMeta>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let path = root.join(META_FILE);
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_meta(&self, meta: &DatabaseMeta) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        fs::create_dir_all(root).await?;
        write_atomic(&root.join(META_FILE), &serde_json::to_vec_pretty(meta)?).await
    }

    /// Load every readable collection file; unreadable files are skipped
    pub async fn read_collections(&self) -> Result<Vec<CollectionFile>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let dir = root.join(COLLECTIONS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let parsed = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<CollectionFile>(&bytes),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable collection file");
                    continue;
                }
            };
            match parsed {
                Ok(file) => files.push(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt collection file, dropping");
                }
            }
        }
        Ok(files)
    }

    pub async fn write_collection(&self, file: &CollectionFile) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let path = Self::collection_path(root, &file.schema.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &serde_json::to_vec(file)?).await
    }

    /// Remove the whole database directory
    pub async fn destroy(&self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        match fs::remove_dir_all(root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
