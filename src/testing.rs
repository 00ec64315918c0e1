//! Test doubles shared by module tests

use crate::edge::{EdgeRequest, EdgeResponse, Upstream};
use crate::error::{Error, Result};
use crate::network::{FetchedBytes, Fetcher};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// [`Fetcher`] serving canned bodies; unknown URLs fail as transport errors
#[derive(Debug, Default)]
pub struct StaticFetcher {
    bodies: HashMap<String, FetchedBytes>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: &'static [u8], content_type: Option<&str>) -> Self {
        self.bodies.insert(
            url.to_string(),
            FetchedBytes {
                bytes: Bytes::from_static(body),
                content_type: content_type.map(str::to_string),
            },
        );
        self
    }

    /// Sleep before answering every request
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedBytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| Error::transport(url, "HTTP 404"))
    }
}

/// [`Upstream`] with canned responses per path and an offline switch
///
/// Unknown paths answer 404 while online.
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    responses: HashMap<String, EdgeResponse>,
    offline: AtomicBool,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, path: &str, status: u16, body: &'static str) -> Self {
        self.responses
            .insert(path.to_string(), EdgeResponse::new(status, body));
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn fetch(&self, request: &EdgeRequest) -> Result<EdgeResponse> {
        *self.calls.lock().entry(request.path.clone()).or_default() += 1;
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transport(&request.path, "connection refused"));
        }
        Ok(self
            .responses
            .get(&request.path)
            .cloned()
            .unwrap_or_else(|| EdgeResponse::new(404, "not found")))
    }
}
