//! Edge proxy state machine and request routing

use super::cache_storage::CacheStorage;
use super::strategy::{self, Outcome, Strategy};
use super::upstream::{Destination, EdgeRequest, EdgeResponse, SharedUpstream};
use super::EdgeConfig;
use crate::error::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Phase and Routing
// =============================================================================

/// Proxy lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePhase {
    Idle,
    Installing,
    Installed,
    Activating,
    Activated,
}

/// Route class of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRoute {
    /// Non-GET, uploads and audio
    Bypass,
    /// API call other than covers
    Api,
    /// Cover image under the API
    Cover,
    /// HTML document
    Document,
    /// Script or stylesheet
    StaticAsset,
    Image,
    Other,
}

impl RequestRoute {
    pub fn strategy(&self) -> Strategy {
        match self {
            RequestRoute::Bypass => Strategy::Passthrough,
            RequestRoute::Api => Strategy::ApiPassthrough,
            RequestRoute::Cover | RequestRoute::StaticAsset | RequestRoute::Image => {
                Strategy::CacheFirst
            }
            RequestRoute::Document | RequestRoute::Other => Strategy::NetworkFirst,
        }
    }
}

/// Result of pre-caching the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    /// Path and reason
    pub failed: Vec<(String, String)>,
}

/// Namespaces removed and kept on activation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

// =============================================================================
// Metrics
// =============================================================================

/// Prometheus counters for one proxy
pub struct EdgeMetrics {
    registry: Registry,
    requests: IntCounterVec,
    install_assets: IntCounterVec,
}

impl EdgeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("edge_requests_total", "Requests handled by the edge proxy"),
            &["strategy", "outcome"],
        )
        .map_err(metrics_error)?;
        let install_assets = IntCounterVec::new(
            Opts::new("edge_install_assets_total", "Manifest assets processed on install"),
            &["result"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(install_assets.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests,
            install_assets,
        })
    }

    fn record_request(&self, strategy: Strategy, outcome: Outcome) {
        self.requests
            .with_label_values(&[&strategy.to_string(), &outcome.to_string()])
            .inc();
    }

    /// Requests counted for a strategy and outcome
    pub fn requests(&self, strategy: Strategy, outcome: Outcome) -> u64 {
        self.requests
            .with_label_values(&[&strategy.to_string(), &outcome.to_string()])
            .get()
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

// =============================================================================
// Edge Cache Proxy
// =============================================================================

/// Request interceptor with versioned cache namespaces
pub struct EdgeCacheProxy {
    config: EdgeConfig,
    storage: Arc<CacheStorage>,
    upstream: SharedUpstream,
    phase: RwLock<EdgePhase>,
    metrics: EdgeMetrics,
}

impl EdgeCacheProxy {
    pub fn new(config: EdgeConfig, upstream: SharedUpstream) -> Result<Self> {
        Self::with_storage(config, upstream, Arc::new(CacheStorage::new()))
    }

    /// Build over existing namespaces (a previous version's caches)
    pub fn with_storage(
        config: EdgeConfig,
        upstream: SharedUpstream,
        storage: Arc<CacheStorage>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            upstream,
            phase: RwLock::new(EdgePhase::Idle),
            metrics: EdgeMetrics::new()?,
        })
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn metrics(&self) -> &EdgeMetrics {
        &self.metrics
    }

    pub fn phase(&self) -> EdgePhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: EdgePhase) {
        *self.phase.write() = phase;
        debug!(?phase, "Edge phase changed");
    }

    /// Classify a request
    pub fn route(&self, request: &EdgeRequest) -> RequestRoute {
        if !request.is_get() {
            return RequestRoute::Bypass;
        }
        let path = request.pathname();
        let lower = path.to_ascii_lowercase();
        if self.config.excluded_paths.iter().any(|p| path.contains(p.as_str()))
            || self
                .config
                .excluded_extensions
                .iter()
                .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
        {
            return RequestRoute::Bypass;
        }
        if path.contains(self.config.cover_prefix.as_str()) {
            return RequestRoute::Cover;
        }
        if path.starts_with(self.config.api_prefix.as_str()) {
            return RequestRoute::Api;
        }
        if request.accepts_html() || request.destination == Some(Destination::Document) {
            return RequestRoute::Document;
        }
        match request.destination {
            Some(Destination::Script) | Some(Destination::Style) => RequestRoute::StaticAsset,
            Some(Destination::Image) => RequestRoute::Image,
            _ => RequestRoute::Other,
        }
    }

    /// Pre-cache the manifest; never fails, failures are reported
    pub async fn install(&self) -> InstallReport {
        self.set_phase(EdgePhase::Installing);
        let namespace = self.storage.open(&self.config.static_namespace());
        info!(assets = self.config.manifest.len(), "Installing edge cache");

        let fetches = self.config.manifest.iter().map(|path| async move {
            let request = EdgeRequest::get(path.clone());
            (path.clone(), self.upstream.fetch(&request).await)
        });

        let mut report = InstallReport::default();
        for (path, result) in join_all(fetches).await {
            match result {
                Ok(response) if response.is_cacheable() => {
                    namespace.put(path.clone(), response);
                    report.cached.push(path);
                }
                Ok(response) => {
                    warn!(path = %path, status = response.status, "Manifest asset not cached");
                    report.failed.push((path, format!("HTTP {}", response.status)));
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Manifest asset not cached");
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        self.metrics
            .install_assets
            .with_label_values(&["cached"])
            .inc_by(report.cached.len() as u64);
        self.metrics
            .install_assets
            .with_label_values(&["failed"])
            .inc_by(report.failed.len() as u64);

        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Edge cache installed"
        );
        self.set_phase(EdgePhase::Installed);
        report
    }

    /// Drop namespaces from prior versions, keeping the current and persistent ones
    pub fn activate(&self) -> ActivateReport {
        if self.phase() != EdgePhase::Installed {
            warn!(phase = ?self.phase(), "Activating without a completed install");
        }
        self.set_phase(EdgePhase::Activating);

        let keep = [self.config.static_namespace(), self.config.image_namespace()];
        let mut report = ActivateReport::default();
        for name in self.storage.names() {
            let owned = name.starts_with(self.config.namespace_prefix.as_str());
            let current = keep.contains(&name) || self.config.persistent_namespaces.contains(&name);
            if owned && !current {
                self.storage.delete(&name);
                info!(namespace = %name, "Deleted old cache namespace");
                report.removed.push(name);
            } else {
                report.kept.push(name);
            }
        }

        self.set_phase(EdgePhase::Activated);
        report
    }

    /// Answer one request
    pub async fn handle(&self, request: &EdgeRequest) -> EdgeResponse {
        let route = if self.phase() == EdgePhase::Activated {
            self.route(request)
        } else {
            RequestRoute::Bypass
        };
        let upstream = self.upstream.as_ref();

        let (response, outcome) = match route {
            RequestRoute::Bypass => strategy::passthrough(upstream, request).await,
            RequestRoute::Api => strategy::api_passthrough(upstream, request).await,
            RequestRoute::Cover | RequestRoute::Image => {
                let images = self.storage.open(&self.config.image_namespace());
                strategy::cache_first(&images, upstream, request).await
            }
            RequestRoute::StaticAsset => {
                let statics = self.storage.open(&self.config.static_namespace());
                strategy::cache_first(&statics, upstream, request).await
            }
            RequestRoute::Document => {
                let statics = self.storage.open(&self.config.static_namespace());
                let shell = Some(self.config.shell_page.as_str());
                strategy::network_first(&self.storage, &statics, upstream, request, shell).await
            }
            RequestRoute::Other => {
                let statics = self.storage.open(&self.config.static_namespace());
                strategy::network_first(&self.storage, &statics, upstream, request, None).await
            }
        };

        self.metrics.record_request(route.strategy(), outcome);
        debug!(path = %request.path, ?route, %outcome, status = response.status, "Edge request");
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedUpstream;

    fn proxy_with(upstream: Arc<ScriptedUpstream>, config: EdgeConfig) -> EdgeCacheProxy {
        EdgeCacheProxy::new(config, upstream).unwrap()
    }

    fn small_config() -> EdgeConfig {
        EdgeConfig {
            manifest: vec!["/".into(), "/static/js/main.js".into(), "/static/css/gone.css".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_routing() {
        let proxy = proxy_with(Arc::new(ScriptedUpstream::new()), EdgeConfig::default());
        let route = |req: EdgeRequest| proxy.route(&req);

        assert_eq!(route(EdgeRequest::new("POST", "/api/x")), RequestRoute::Bypass);
        assert_eq!(route(EdgeRequest::get("/music/a.MP3")), RequestRoute::Bypass);
        assert_eq!(route(EdgeRequest::get("/upload/file")), RequestRoute::Bypass);
        assert_eq!(route(EdgeRequest::get("/api/music/covers/a.jpg")), RequestRoute::Cover);
        assert_eq!(route(EdgeRequest::get("/api/music")), RequestRoute::Api);
        assert_eq!(
            route(EdgeRequest::get("/").with_accept("text/html,application/xhtml+xml")),
            RequestRoute::Document
        );
        assert_eq!(
            route(EdgeRequest::get("/static/js/ui.js").with_destination(Destination::Script)),
            RequestRoute::StaticAsset
        );
        assert_eq!(
            route(EdgeRequest::get("/static/images/BG.png").with_destination(Destination::Image)),
            RequestRoute::Image
        );
        assert_eq!(route(EdgeRequest::get("/manifest.json")), RequestRoute::Other);
    }

    #[tokio::test]
    async fn test_partial_install_still_activates() {
        let upstream = Arc::new(
            ScriptedUpstream::new()
                .respond("/", 200, "<shell>")
                .respond("/static/js/main.js", 200, "js"),
        );
        let proxy = proxy_with(upstream, small_config());

        let report = proxy.install().await;
        assert_eq!(report.cached.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].1, "HTTP 404");
        assert_eq!(proxy.phase(), EdgePhase::Installed);

        proxy.activate();
        assert_eq!(proxy.phase(), EdgePhase::Activated);
    }

    #[tokio::test]
    async fn test_activate_drops_old_versions_only() {
        let storage = Arc::new(CacheStorage::new());
        storage.open("2fmusic-v0-static");
        storage.open("2fmusic-v0-api");
        storage.open("2fmusic-v1-images").put("/c.jpg", EdgeResponse::new(200, "img"));
        storage.open("2fmusic-pinned");
        storage.open("thirdparty");

        let config = EdgeConfig {
            manifest: Vec::new(),
            persistent_namespaces: vec!["2fmusic-pinned".into()],
            ..Default::default()
        };
        let proxy =
            EdgeCacheProxy::with_storage(config, Arc::new(ScriptedUpstream::new()), storage.clone())
                .unwrap();
        proxy.install().await;
        let report = proxy.activate();

        assert_eq!(
            report.removed,
            vec!["2fmusic-v0-static".to_string(), "2fmusic-v0-api".to_string()]
        );
        assert!(storage.has("2fmusic-v1-images"));
        assert!(storage.has("2fmusic-v1-static"));
        assert!(storage.has("2fmusic-pinned"));
        assert!(storage.has("thirdparty"));
        assert!(storage.match_any("/c.jpg").is_some());
    }

    #[tokio::test]
    async fn test_requests_before_activation_pass_through() {
        let upstream = Arc::new(ScriptedUpstream::new().respond("/static/js/ui.js", 200, "js"));
        let proxy = proxy_with(upstream.clone(), small_config());

        let req = EdgeRequest::get("/static/js/ui.js").with_destination(Destination::Script);
        proxy.handle(&req).await;
        assert!(proxy.storage().match_any("/static/js/ui.js").is_none());

        proxy.install().await;
        proxy.activate();
        proxy.handle(&req).await;
        assert!(proxy.storage().match_any("/static/js/ui.js").is_some());
        assert_eq!(
            proxy.metrics().requests(Strategy::CacheFirst, Outcome::Network),
            1
        );
    }

    #[tokio::test]
    async fn test_offline_behaviour() {
        let upstream = Arc::new(
            ScriptedUpstream::new()
                .respond("/", 200, "<shell>")
                .respond("/static/js/main.js", 200, "js")
                .respond("/api/music/covers/a.jpg", 200, "jpeg"),
        );
        let proxy = proxy_with(upstream.clone(), small_config());
        proxy.install().await;
        proxy.activate();

        let cover = EdgeRequest::get("/api/music/covers/a.jpg");
        proxy.handle(&cover).await;
        upstream.set_offline(true);

        let resp = proxy.handle(&cover).await;
        assert_eq!(&resp.body[..], b"jpeg");

        let resp = proxy
            .handle(&EdgeRequest::get("/playlist/9").with_accept("text/html"))
            .await;
        assert_eq!(&resp.body[..], b"<shell>");

        let resp = proxy.handle(&EdgeRequest::get("/api/music")).await;
        assert_eq!(resp.status, 503);
        assert_eq!(resp.header("content-type"), Some("application/json"));

        let resp = proxy
            .handle(&EdgeRequest::get("/static/images/new.png").with_destination(Destination::Image))
            .await;
        assert_eq!(resp.status, 503);

        let resp = proxy.handle(&EdgeRequest::new("POST", "/api/upload")).await;
        assert_eq!(resp.status, 502);
    }

    #[tokio::test]
    async fn test_api_bodies_stay_out_of_edge_cache() {
        let storage = Arc::new(CacheStorage::new());
        let upstream = Arc::new(ScriptedUpstream::new().respond("/api/music", 200, "[1,2]"));
        let proxy = EdgeCacheProxy::with_storage(
            EdgeConfig {
                manifest: Vec::new(),
                ..Default::default()
            },
            upstream.clone(),
            storage.clone(),
        )
        .unwrap();
        proxy.install().await;
        proxy.activate();

        let api = EdgeRequest::get("/api/music");
        assert_eq!(&proxy.handle(&api).await.body[..], b"[1,2]");
        assert!(storage.match_any("/api/music").is_none());

        upstream.set_offline(true);
        let resp = proxy.handle(&api).await;
        assert_eq!(resp.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["offline"], true);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let proxy = proxy_with(Arc::new(ScriptedUpstream::new()), small_config());
        proxy.install().await;
        let (content_type, body) = proxy.metrics().encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("edge_install_assets_total{result=\"failed\"} 3"));
    }
}
