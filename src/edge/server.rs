//! Edge HTTP Server
//!
//! Serves every request through the proxy, plus health and metrics routes
//! under `/__edge/`.

use super::proxy::{EdgeCacheProxy, EdgePhase};
use super::upstream::{Destination, EdgeRequest, EdgeResponse};
use crate::error::{Error, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Edge server configuration
#[derive(Debug, Clone)]
pub struct EdgeServerConfig {
    pub addr: SocketAddr,
}

impl Default for EdgeServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8095)),
        }
    }
}

/// HTTP front of an [`EdgeCacheProxy`]
pub struct EdgeServer {
    config: EdgeServerConfig,
    proxy: Arc<EdgeCacheProxy>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EdgeServer {
    pub fn new(config: EdgeServerConfig, proxy: Arc<EdgeCacheProxy>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            proxy,
            shutdown_tx,
        }
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.proxy))
    }

    /// Serve until [`EdgeServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.addr;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind edge server: {}", e)))?;
        info!("Edge proxy listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Edge server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Edge server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn router(proxy: Arc<EdgeCacheProxy>) -> Router {
    Router::new()
        .route("/__edge/healthz", get(healthz))
        .route("/__edge/metrics", get(metrics))
        .fallback(intercept)
        .layer(TraceLayer::new_for_http())
        .with_state(proxy)
}

async fn healthz(State(proxy): State<Arc<EdgeCacheProxy>>) -> impl IntoResponse {
    match proxy.phase() {
        EdgePhase::Activated => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "starting"),
    }
}

async fn metrics(State(proxy): State<Arc<EdgeCacheProxy>>) -> Response {
    match proxy.metrics().encode() {
        Ok((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn intercept(
    State(proxy): State<Arc<EdgeCacheProxy>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = to_edge_request(&method, &uri, &headers, body);
    into_response(proxy.handle(&request).await)
}

fn to_edge_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> EdgeRequest {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    EdgeRequest {
        method: method.as_str().to_string(),
        path,
        accept: text("accept"),
        destination: text("sec-fetch-dest").map(|d| Destination::parse(&d)),
        content_type: text("content-type"),
        body,
    }
}

fn into_response(response: EdgeResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    (status, headers, Body::from(response.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeConfig;
    use crate::testing::ScriptedUpstream;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn activated_proxy() -> Arc<EdgeCacheProxy> {
        let upstream = Arc::new(
            ScriptedUpstream::new()
                .respond("/", 200, "<shell>")
                .respond("/static/css/style.css?v=2", 200, "css"),
        );
        let config = EdgeConfig {
            manifest: vec!["/".into()],
            ..Default::default()
        };
        let proxy = Arc::new(EdgeCacheProxy::new(config, upstream).unwrap());
        proxy.install().await;
        proxy.activate();
        proxy
    }

    #[test]
    fn test_default_config() {
        assert_eq!(EdgeServerConfig::default().addr.port(), 8095);
    }

    #[tokio::test]
    async fn test_health_and_metrics_routes() {
        let app = router(activated_proxy().await);

        let response = app
            .clone()
            .oneshot(Request::get("/__edge/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/__edge/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_text(response).await.contains("edge_install_assets_total"));
    }

    #[tokio::test]
    async fn test_fallback_goes_through_proxy() {
        let proxy = activated_proxy().await;
        let app = router(proxy.clone());

        let request = Request::get("/static/css/style.css?v=2")
            .header("sec-fetch-dest", "style")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "css");
        assert!(proxy.storage().match_any("/static/css/style.css?v=2").is_some());
    }

    #[test]
    fn test_response_conversion_skips_bad_headers() {
        let response = into_response(
            EdgeResponse::new(200, "x")
                .with_header("x-ok", "1")
                .with_header("bad header", "2"),
        );
        assert_eq!(response.headers().get("x-ok").unwrap(), "1");
        assert_eq!(response.headers().len(), 1);
    }
}
