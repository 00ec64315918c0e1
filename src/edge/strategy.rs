//! Cache strategies
//!
//! Each strategy answers a request and reports which path produced the
//! answer. None of them surface a transport error: double failures become
//! typed 503 responses.

use super::cache_storage::{CacheStorage, Namespace};
use super::upstream::{EdgeRequest, EdgeResponse, Upstream};
use std::fmt;
use tracing::{debug, warn};

/// Strategy picked for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    ApiPassthrough,
    Passthrough,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::CacheFirst => "cache_first",
            Strategy::NetworkFirst => "network_first",
            Strategy::ApiPassthrough => "api",
            Strategy::Passthrough => "passthrough",
        };
        f.write_str(name)
    }
}

/// Which path produced a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from a cache namespace
    CacheHit,
    /// Served from the origin
    Network,
    /// Origin failed, an older cached copy answered
    CacheFallback,
    /// Origin failed, the shell page answered
    Shell,
    /// Origin failed with nothing cached
    Unavailable,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::CacheHit => "cache_hit",
            Outcome::Network => "network",
            Outcome::CacheFallback => "cache_fallback",
            Outcome::Shell => "shell",
            Outcome::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Serve from cache, fill from network on miss
///
/// Non-200 network answers are returned but not stored.
pub async fn cache_first(
    namespace: &Namespace,
    upstream: &dyn Upstream,
    request: &EdgeRequest,
) -> (EdgeResponse, Outcome) {
    let key = request.cache_key();
    if let Some(cached) = namespace.get(key) {
        debug!(path = %key, "Edge cache hit");
        return (cached, Outcome::CacheHit);
    }

    match upstream.fetch(request).await {
        Ok(response) => {
            if response.is_cacheable() {
                namespace.put(key, response.clone());
            }
            (response, Outcome::Network)
        }
        Err(e) => {
            warn!(path = %key, error = %e, "No cached copy and origin unreachable");
            (EdgeResponse::unavailable(), Outcome::Unavailable)
        }
    }
}

/// Serve from network and refresh `namespace`; fall back to any cached copy
///
/// A non-200 answer counts as a failure. `shell` answers documents when
/// nothing else is cached.
pub async fn network_first(
    storage: &CacheStorage,
    namespace: &Namespace,
    upstream: &dyn Upstream,
    request: &EdgeRequest,
    shell: Option<&str>,
) -> (EdgeResponse, Outcome) {
    let key = request.cache_key();
    let failure = match upstream.fetch(request).await {
        Ok(response) if response.is_cacheable() => {
            namespace.put(key, response.clone());
            return (response, Outcome::Network);
        }
        Ok(response) => format!("HTTP {}", response.status),
        Err(e) => e.to_string(),
    };
    debug!(path = %key, reason = %failure, "Network failed, trying cache");

    if let Some(cached) = storage.match_any(key) {
        return (cached, Outcome::CacheFallback);
    }
    if let Some(shell) = shell {
        if let Some(page) = storage.match_any(shell) {
            return (page, Outcome::Shell);
        }
    }
    warn!(path = %key, reason = %failure, "Nothing cached for failed request");
    (EdgeResponse::unavailable(), Outcome::Unavailable)
}

/// Forward API calls; a transport failure becomes the typed offline payload
///
/// API bodies are never cached here. The cache coordinator owns that data.
pub async fn api_passthrough(
    upstream: &dyn Upstream,
    request: &EdgeRequest,
) -> (EdgeResponse, Outcome) {
    match upstream.fetch(request).await {
        Ok(response) => (response, Outcome::Network),
        Err(e) => {
            debug!(path = %request.path, error = %e, "API unreachable");
            (
                EdgeResponse::offline_json("Offline, check the network connection"),
                Outcome::Unavailable,
            )
        }
    }
}

/// Forward without touching any cache
pub async fn passthrough(
    upstream: &dyn Upstream,
    request: &EdgeRequest,
) -> (EdgeResponse, Outcome) {
    match upstream.fetch(request).await {
        Ok(response) => (response, Outcome::Network),
        Err(e) => (EdgeResponse::bad_gateway(&e.to_string()), Outcome::Unavailable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedUpstream;

    #[tokio::test]
    async fn test_cache_first_fills_then_hits() {
        let upstream = ScriptedUpstream::new().respond("/a.css", 200, "body");
        let ns = Namespace::default();
        let req = EdgeRequest::get("/a.css");

        let (resp, outcome) = cache_first(&ns, &upstream, &req).await;
        assert_eq!((resp.status, outcome), (200, Outcome::Network));

        upstream.set_offline(true);
        let (resp, outcome) = cache_first(&ns, &upstream, &req).await;
        assert_eq!(outcome, Outcome::CacheHit);
        assert_eq!(&resp.body[..], b"body");
        assert_eq!(upstream.calls("/a.css"), 1);
    }

    #[tokio::test]
    async fn test_cache_first_does_not_store_errors() {
        let upstream = ScriptedUpstream::new().respond("/missing.png", 404, "");
        let ns = Namespace::default();
        let req = EdgeRequest::get("/missing.png");

        let (resp, _) = cache_first(&ns, &upstream, &req).await;
        assert_eq!(resp.status, 404);
        assert!(ns.is_empty());

        upstream.set_offline(true);
        let (resp, outcome) = cache_first(&ns, &upstream, &req).await;
        assert_eq!((resp.status, outcome), (503, Outcome::Unavailable));
    }

    #[tokio::test]
    async fn test_network_first_fallbacks() {
        let storage = CacheStorage::new();
        let ns = storage.open("static");
        let upstream = ScriptedUpstream::new()
            .respond("/", 200, "<shell>")
            .respond("/page", 200, "<page>");

        network_first(&storage, &ns, &upstream, &EdgeRequest::get("/"), Some("/")).await;
        network_first(&storage, &ns, &upstream, &EdgeRequest::get("/page"), Some("/")).await;

        upstream.set_offline(true);
        let (resp, outcome) =
            network_first(&storage, &ns, &upstream, &EdgeRequest::get("/page"), Some("/")).await;
        assert_eq!(outcome, Outcome::CacheFallback);
        assert_eq!(&resp.body[..], b"<page>");

        let (resp, outcome) =
            network_first(&storage, &ns, &upstream, &EdgeRequest::get("/other"), Some("/")).await;
        assert_eq!(outcome, Outcome::Shell);
        assert_eq!(&resp.body[..], b"<shell>");

        let (resp, outcome) =
            network_first(&storage, &ns, &upstream, &EdgeRequest::get("/other"), None).await;
        assert_eq!((resp.status, outcome), (503, Outcome::Unavailable));
    }

    #[tokio::test]
    async fn test_network_first_treats_non_200_as_failure() {
        let storage = CacheStorage::new();
        let ns = storage.open("static");
        ns.put("/x", EdgeResponse::new(200, "cached"));
        let upstream = ScriptedUpstream::new().respond("/x", 500, "boom");

        let (resp, outcome) = network_first(&storage, &ns, &upstream, &EdgeRequest::get("/x"), None).await;
        assert_eq!(outcome, Outcome::CacheFallback);
        assert_eq!(&resp.body[..], b"cached");
    }

    #[tokio::test]
    async fn test_api_offline_payload() {
        let upstream = ScriptedUpstream::new();
        upstream.set_offline(true);
        let (resp, _) = api_passthrough(&upstream, &EdgeRequest::get("/api/music")).await;
        assert_eq!(resp.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["offline"], true);
    }
}
