//! Edge Requests, Responses and the Origin
//!
//! Transport-neutral request/response types used by the proxy and its
//! strategies, and the [`Upstream`] seam that reaches the origin server.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// =============================================================================
// Request
// =============================================================================

/// What the requester will do with the response (`Sec-Fetch-Dest`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Other,
}

impl Destination {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" | "iframe" | "frame" => Destination::Document,
            "script" | "worker" | "sharedworker" => Destination::Script,
            "style" => Destination::Style,
            "image" => Destination::Image,
            _ => Destination::Other,
        }
    }
}

/// Incoming request as seen by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRequest {
    /// Upper-case method name
    pub method: String,
    /// Path plus query string
    pub path: String,
    pub accept: Option<String>,
    pub destination: Option<Destination>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl EdgeRequest {
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.into(),
            accept: None,
            destination: None,
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// Path without the query string
    pub fn pathname(&self) -> &str {
        self.path.split(['?', '#']).next().unwrap_or("")
    }

    pub fn accepts_html(&self) -> bool {
        self.accept
            .as_deref()
            .map(|a| a.contains("text/html"))
            .unwrap_or(false)
    }

    /// Cache key; query strings distinguish entries
    pub fn cache_key(&self) -> &str {
        &self.path
    }
}

// =============================================================================
// Response
// =============================================================================

/// Response body plus the headers worth replaying from cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl EdgeResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Only 200 responses are cached
    pub fn is_cacheable(&self) -> bool {
        self.status == 200
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Typed 503 for API-shaped requests
    pub fn offline_json(message: &str) -> Self {
        let body = json!({
            "success": false,
            "message": message,
            "offline": true,
        });
        Self::new(503, body.to_string()).with_header("content-type", "application/json")
    }

    /// 503 when neither cache nor network can answer
    pub fn unavailable() -> Self {
        Self::new(503, "offline: resource unavailable")
            .with_header("content-type", "text/plain; charset=utf-8")
    }

    /// 502 for passthrough requests the origin never answered
    pub fn bad_gateway(reason: &str) -> Self {
        Self::new(502, format!("upstream unavailable: {}", reason))
            .with_header("content-type", "text/plain; charset=utf-8")
    }
}

// =============================================================================
// Upstream
// =============================================================================

/// The origin server
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward a request; any answered status is `Ok`
    async fn fetch(&self, request: &EdgeRequest) -> Result<EdgeResponse>;
}

/// Type alias for a shared upstream
pub type SharedUpstream = Arc<dyn Upstream>;

/// Hop-by-hop and framing headers never replayed to clients
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// [`Upstream`] backed by `reqwest`
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    origin: Url,
}

impl HttpUpstream {
    pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &EdgeRequest) -> Result<EdgeResponse> {
        let url = self
            .origin
            .join(&request.path)
            .map_err(|e| Error::transport(&request.path, e))?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::transport(&request.path, e))?;

        let mut builder = self.client.request(method, url);
        if let Some(accept) = &request.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(EdgeResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_helpers() {
        let req = EdgeRequest::get("/static/js/main.js?v=3").with_accept("text/html,*/*");
        assert_eq!(req.pathname(), "/static/js/main.js");
        assert_eq!(req.cache_key(), "/static/js/main.js?v=3");
        assert!(req.accepts_html());
        assert!(!EdgeRequest::new("post", "/api/x").is_get());
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!(Destination::parse("Script"), Destination::Script);
        assert_eq!(Destination::parse("document"), Destination::Document);
        assert_eq!(Destination::parse("audio"), Destination::Other);
    }

    #[test]
    fn test_typed_failures() {
        let offline = EdgeResponse::offline_json("offline");
        assert_eq!(offline.status, 503);
        assert_eq!(offline.header("Content-Type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(&offline.body).unwrap();
        assert_eq!(body["offline"], true);
        assert_eq!(body["success"], false);

        assert_eq!(EdgeResponse::unavailable().status, 503);
        assert!(!EdgeResponse::new(404, "").is_cacheable());
    }
}
