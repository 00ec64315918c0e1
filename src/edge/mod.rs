//! Edge Cache Proxy
//!
//! An independently running request interceptor that serves application
//! assets and cover images from versioned cache namespaces. It never talks
//! to the cache coordinator or the object store.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──install()──► Installing ──► Installed ──activate()──► Activating ──► Activated
//!                        (pre-cache                               (drop old
//!                         manifest)                                namespaces)
//! ```
//!
//! Requests arriving before activation are forwarded without caching.

mod cache_storage;
mod proxy;
mod server;
mod strategy;
mod upstream;

pub use cache_storage::{CacheStorage, Namespace};
pub use proxy::{ActivateReport, EdgeCacheProxy, EdgeMetrics, EdgePhase, InstallReport, RequestRoute};
pub use server::{EdgeServer, EdgeServerConfig};
pub use strategy::{Outcome, Strategy};
pub use upstream::{
    Destination, EdgeRequest, EdgeResponse, HttpUpstream, SharedUpstream, Upstream,
};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;

/// Assets pre-cached on install
pub const CRITICAL_ASSETS: &[&str] = &[
    "/",
    "/static/css/style.css",
    "/static/css/favorites.css",
    "/static/css/artist-aggregate.css",
    "/static/css/queue-manager.css",
    "/static/css/font-awesome/all.min.css",
    "/static/js/main.js",
    "/static/js/state.js",
    "/static/js/player.js",
    "/static/js/ui.js",
    "/static/js/utils.js",
    "/static/js/api.js",
    "/static/js/netease.js",
    "/static/js/mounts.js",
    "/static/js/favorites.js",
    "/static/js/batch-manager.js",
    "/static/js/artist-aggregate.js",
    "/static/js/queue-manager.js",
    "/static/js/db.js",
    "/static/js/lib/color-thief.umd.js",
    "/static/images/ICON_256.PNG",
    "/static/images/BG.png",
];

/// Edge proxy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Address the proxy listens on
    pub listen: String,
    /// Origin server every request is forwarded to
    pub origin: String,
    /// Current cache version; namespaces are `<version>-static` and `<version>-images`
    pub cache_version: String,
    /// Namespaces owned by the proxy start with this
    pub namespace_prefix: String,
    /// Paths pre-cached on install
    pub manifest: Vec<String>,
    /// Path fragments that are never intercepted
    pub excluded_paths: Vec<String>,
    /// File extensions that are never intercepted (audio)
    pub excluded_extensions: Vec<String>,
    /// Extra namespaces kept on activation
    pub persistent_namespaces: Vec<String>,
    /// Page served for documents when offline and uncached
    pub shell_page: String,
    pub cover_prefix: String,
    pub api_prefix: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8095".to_string(),
            origin: "http://127.0.0.1:5000/".to_string(),
            cache_version: "2fmusic-v1".to_string(),
            namespace_prefix: "2fmusic-".to_string(),
            manifest: CRITICAL_ASSETS.iter().map(|s| s.to_string()).collect(),
            excluded_paths: vec!["/upload/".to_string()],
            excluded_extensions: [".mp3", ".flac", ".wav", ".ogg", ".m4a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            persistent_namespaces: Vec::new(),
            shell_page: "/".to_string(),
            cover_prefix: "/api/music/covers/".to_string(),
            api_prefix: "/api/".to_string(),
        }
    }
}

impl EdgeConfig {
    pub fn static_namespace(&self) -> String {
        format!("{}-static", self.cache_version)
    }

    pub fn image_namespace(&self) -> String {
        format!("{}-images", self.cache_version)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid edge listen address: {}", e)))
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| Error::Configuration(format!("Invalid edge origin: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(Error::Configuration(
                "edge.cache_version must not be empty".to_string(),
            ));
        }
        if self.namespace_prefix.is_empty() {
            return Err(Error::Configuration(
                "edge.namespace_prefix must not be empty".to_string(),
            ));
        }
        self.listen_addr()?;
        self.origin_url()?;
        Ok(())
    }
}
