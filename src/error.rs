//! Error types for the offline cache engine
//!
//! Provides structured error types for every tier of the cache: the network
//! transport, the durable object store, the backup key-value store, schema
//! migration and the edge cache proxy.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Transport error fetching {target}: {reason}")]
    Transport { target: String, reason: String },

    #[error("Timed out fetching {target} after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Durable Object Store Errors
    // =========================================================================
    #[error("Schema conflict: stored version {stored} is newer than requested {requested}")]
    SchemaConflict { stored: u32, requested: u32 },

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Collection not found: {collection}")]
    CollectionNotFound { collection: String },

    #[error("Index not found: {collection}.{index}")]
    IndexNotFound { collection: String, index: String },

    #[error("Unique index {collection}.{index} already holds key {existing}")]
    ConstraintViolation {
        collection: String,
        index: String,
        existing: String,
    },

    #[error("Invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("Migration step v{version} failed: {reason}")]
    MigrationStep { version: u32, reason: String },

    // =========================================================================
    // Backup Store Errors
    // =========================================================================
    #[error("Backup quota exceeded writing {key}: needed {needed} bytes, available {available} bytes")]
    QuotaExceeded {
        key: String,
        needed: u64,
        available: u64,
    },

    #[error("Backup store unavailable: {0}")]
    BackupUnavailable(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller inside the cache engine should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Convert into an attempt on the next tier of the fallback chain
    Fallback,
    /// Drop and recreate the store (data loss accepted)
    Recreate,
    /// Log and ignore; caching is best-effort
    Swallow,
    /// Hand back to the caller
    Propagate,
}

impl Error {
    /// Build a transport error for a target
    pub fn transport(target: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine how this error is handled at a tier boundary
    pub fn disposition(&self) -> Disposition {
        match self {
            // Network and store failures feed the next tier
            Error::Transport { .. }
            | Error::Timeout { .. }
            | Error::Http(_)
            | Error::StoreUnavailable(_)
            | Error::CollectionNotFound { .. }
            | Error::BackupUnavailable(_) => Disposition::Fallback,

            // A newer on-disk schema is wiped rather than surfaced
            Error::SchemaConflict { .. } => Disposition::Recreate,

            // Best-effort writes
            Error::QuotaExceeded { .. } | Error::ConstraintViolation { .. } => {
                Disposition::Swallow
            }

            _ => Disposition::Propagate,
        }
    }

    /// Check if this error came from the network layer
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout { .. } | Error::Http(_)
        )
    }

    /// Check if the engine can continue without surfacing this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.disposition(), Disposition::Propagate)
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;
