//! Live network access for the cache strategies

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::models::{RequestDescriptor, StoredResponse};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that describe one connection rather than the resource
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_forwardable(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    !HOP_BY_HOP.contains(&name.as_str()) && name != "host" && name != "content-length"
}

/// A live network fetch
///
/// Non-2xx statuses are responses, not errors; `Err` means the network could
/// not be reached at all.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &RequestDescriptor, body: Bytes) -> Result<StoredResponse>;
}

/// `Fetcher` backed by a reqwest client
///
/// Redirects are never followed: a 3xx goes back to the requester as-is so
/// relative URLs resolve against the redirect target.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher without a request timeout
    pub fn new() -> Result<Self> {
        Self::build(Client::builder())
    }

    /// Create a fetcher with a request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Self::build(Client::builder().timeout(timeout))
    }

    fn build(builder: reqwest::ClientBuilder) -> Result<Self> {
        let client = builder
            .redirect(Policy::none())
            .build()
            .map_err(|e| ProxyError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpFetcher { client })
    }

    /// Create a fetcher honoring `fetch_timeout_secs`
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        match config.fetch_timeout_secs {
            Some(secs) => Self::with_timeout(Duration::from_secs(secs)),
            None => Self::new(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &RequestDescriptor, body: Bytes) -> Result<StoredResponse> {
        debug!("Live fetch: method={}, url={}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            if is_forwardable(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!("Live fetch failed for url={}: {}", request.url, e);
            ProxyError::from(e)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| is_forwardable(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| {
            warn!("Reading response body failed for url={}: {}", request.url, e);
            ProxyError::NetworkError(format!("response body: {}", e))
        })?;

        debug!(
            "Live fetch complete: url={}, status={}, size={}",
            request.url,
            status,
            body.len()
        );

        Ok(StoredResponse::new(status, headers, body))
    }
}
