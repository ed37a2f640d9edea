//! Metrics HTTP endpoint
//!
//! Serves the proxy's Prometheus metrics on a separate port, next to a
//! health check and a small index page.

use crate::error::Result;
use crate::metrics::ProxyMetrics;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<ProxyMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use opus2mp3_proxy::metrics::ProxyMetrics;
    /// use opus2mp3_proxy::metrics_endpoint::MetricsEndpoint;
    /// use std::sync::Arc;
    ///
    /// let metrics = Arc::new(ProxyMetrics::new().unwrap());
    /// let endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: Arc<ProxyMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve until the process exits
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { Ok::<_, Infallible>(handle_request(&req, &metrics)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn handle_request<B>(req: &Request<B>, metrics: &ProxyMetrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => metrics_response(metrics),
        "/health" => text_response(
            StatusCode::OK,
            "application/json",
            serde_json::json!({ "status": "healthy" }).to_string(),
        ),
        "/" => text_response(StatusCode::OK, "text/html; charset=utf-8", INDEX_PAGE),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found"),
    }
}

fn metrics_response(metrics: &ProxyMetrics) -> Response<Full<Bytes>> {
    match metrics.encode() {
        Ok(body) => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            body,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "metrics unavailable",
            )
        }
    }
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>opus2mp3 proxy metrics</title></head>
<body>
    <h1>opus2mp3 proxy</h1>
    <ul>
        <li><a href="/metrics">/metrics</a> - Prometheus format metrics</li>
        <li><a href="/health">/health</a> - Health check</li>
    </ul>
</body>
</html>"#;
