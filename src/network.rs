//! Network Access
//!
//! Byte downloads used by the cover pass and the legacy migrator, and the
//! timeout wrapper every network-dependent path goes through. A timeout is
//! reported as a transport-class error so it feeds the same fallback chain
//! as a failed request.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Downloaded body plus its declared media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBytes {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Binary downloads
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download a resource; non-success statuses are transport errors
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedBytes>;
}

/// Type alias for a shared fetcher
pub type SharedFetcher = Arc<dyn Fetcher>;

/// Run `fut` with a deadline; expiry becomes [`Error::Timeout`]
pub async fn with_timeout<T, F>(target: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            target: target.to_string(),
            after,
        }),
    }
}

// =============================================================================
// HTTP Fetcher
// =============================================================================

/// [`Fetcher`] backed by `reqwest`
///
/// Relative URLs (such as `/api/music/covers/a.jpg` returned by the server)
/// are resolved against the configured origin.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: Option<Url>,
}

impl HttpFetcher {
    pub fn new(origin: Option<Url>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { client, origin })
    }

    /// Resolve a possibly relative URL against the origin
    pub fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.origin {
                Some(origin) => origin
                    .join(url)
                    .map_err(|e| Error::transport(url, e)),
                None => Err(Error::transport(url, "relative URL without an origin")),
            },
            Err(e) => Err(Error::transport(url, e)),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedBytes> {
        let resolved = self.resolve(url)?;
        let response = self.client.get(resolved).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(url, format!("HTTP {}", status.as_u16())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok(FetchedBytes {
            bytes,
            content_type,
        })
    }
}
