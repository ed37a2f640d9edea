//! HTTP interception server
//!
//! Every request reaching the listener becomes a fetch event for the
//! `OfflineWorker`. Requests the worker declines are forwarded to the
//! network unchanged.

use crate::error::{ProxyError, Result};
use crate::lifecycle::{FetchOutcome, InterceptedRequest, OfflineWorker};
use crate::models::{RequestDescriptor, StoredResponse};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

/// hyper HTTP/1 front end for the worker
pub struct InterceptionServer {
    worker: Arc<OfflineWorker>,
}

impl InterceptionServer {
    pub fn new(worker: Arc<OfflineWorker>) -> Self {
        InterceptionServer { worker }
    }

    /// Bind `addr` and serve until the process exits
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "Interception server listening on http://{}, origin={}",
            listener.local_addr()?,
            self.worker.config().app_origin
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let worker = Arc::clone(&self.worker);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let worker = Arc::clone(&worker);
                    async move { Ok::<_, Infallible>(handle_request(&worker, req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}

/// Turn one HTTP request into a fetch event and answer it
pub async fn handle_request<B>(worker: &OfflineWorker, req: Request<B>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    debug!("{} {}", parts.method, parts.uri);

    let url = match request_url(&worker.config().app_origin, &parts.uri) {
        Ok(url) => url,
        Err(e) => {
            warn!("Rejected request {} {}: {}", parts.method, parts.uri, e);
            return error_response(&e);
        }
    };
    let descriptor = RequestDescriptor::new(parts.method, url).with_headers(parts.headers);

    let outcome = match read_body(body).await {
        Ok(body) => dispatch(worker, InterceptedRequest::new(descriptor.clone(), body)).await,
        Err(e) => {
            warn!("Unreadable body for {} {}: {}", descriptor.method, descriptor.url, e);
            worker.handle_unreadable(&descriptor, e)
        }
    };

    match outcome {
        Ok(response) => to_http_response(response),
        Err(e) => {
            warn!("Request failed: {} {}: {}", descriptor.method, descriptor.url, e);
            error_response(&e)
        }
    }
}

async fn dispatch(worker: &OfflineWorker, intercepted: InterceptedRequest) -> Result<StoredResponse> {
    match worker.handle_fetch(intercepted.clone()).await? {
        FetchOutcome::Respond(response) => Ok(response),
        FetchOutcome::Passthrough => worker.passthrough(&intercepted).await,
    }
}

async fn read_body<B>(body: B) -> Result<Bytes>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProxyError::InvalidRequest(format!("reading request body: {}", e)))
}

/// Absolute URL of a request; origin-form targets resolve against `origin`
fn request_url(origin: &str, uri: &http::Uri) -> Result<Url> {
    let raw = if uri.scheme().is_some() && uri.authority().is_some() {
        uri.to_string()
    } else {
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", origin.trim_end_matches('/'), target)
    };

    Url::parse(&raw)
        .map_err(|e| ProxyError::InvalidRequest(format!("bad request target '{}': {}", raw, e)))
}

fn to_http_response(stored: StoredResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Full::new(stored.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &stored.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("Dropping unrepresentable header: {}", name),
        }
    }
    response
}

fn error_response(error: &ProxyError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = status.canonical_reason().unwrap_or("Error");

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}
