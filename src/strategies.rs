//! Cache-first and network-first response strategies
//!
//! Both strategies read and write the versioned asset partition only. A copy
//! of a live response is stored when its status is 2xx and it is the whole
//! resource: range requests and 206 answers are passed on uncached. The
//! original is returned to the caller. Write failures are logged and never
//! fail the request.

use crate::cache_store::CacheStorage;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::metrics::ProxyMetrics;
use crate::models::{RequestDescriptor, StoredResponse};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const CACHE_FIRST: &str = "cache_first";
const NETWORK_FIRST: &str = "network_first";

/// Executes the two caching policies against the store and the network
pub struct CacheStrategies {
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    asset_cache: String,
    offline_shell_key: String,
    metrics: Arc<ProxyMetrics>,
}

impl CacheStrategies {
    pub fn new(
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        config: &ProxyConfig,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        Ok(CacheStrategies {
            storage,
            fetcher,
            asset_cache: config.asset_cache_name.clone(),
            offline_shell_key: config.offline_shell_url()?.to_string(),
            metrics,
        })
    }

    /// Serve from the asset partition; on a miss fetch live and populate
    ///
    /// A hit is returned as-is, with no revalidation. A live fetch failure
    /// propagates: there is nothing else to fall back to.
    pub async fn cache_first(&self, request: &RequestDescriptor) -> Result<StoredResponse> {
        let key = request.cache_key();

        if let Some(cached) = self.lookup(&key).await {
            self.metrics.record_cache_lookup(CACHE_FIRST, true);
            debug!("Cache-first hit: {}", key);
            return Ok(cached);
        }
        self.metrics.record_cache_lookup(CACHE_FIRST, false);

        let response = self.live_fetch(CACHE_FIRST, request).await?;
        self.store_copy(request, &response).await;
        Ok(response)
    }

    /// Fetch live and keep the cache warm; fall back to the cache offline
    ///
    /// Fallback order when the network is unreachable: a cached copy of the
    /// same request, then (navigations only) the offline shell, then the
    /// original error. Other fetch errors propagate without a fallback.
    pub async fn network_first(&self, request: &RequestDescriptor) -> Result<StoredResponse> {
        let key = request.cache_key();

        let error = match self.live_fetch(NETWORK_FIRST, request).await {
            Ok(response) => {
                self.store_copy(request, &response).await;
                return Ok(response);
            }
            Err(e) if e.is_network_failure() => e,
            Err(e) => return Err(e),
        };

        if let Some(cached) = self.lookup(&key).await {
            self.metrics.record_cache_lookup(NETWORK_FIRST, true);
            self.metrics.record_offline_fallback("cached");
            info!("Network unavailable, serving cached copy: {}", key);
            return Ok(cached);
        }
        self.metrics.record_cache_lookup(NETWORK_FIRST, false);

        if request.is_navigation() {
            if let Some(shell) = self.lookup(&self.offline_shell_key).await {
                self.metrics.record_offline_fallback("shell");
                info!("Network unavailable, serving offline shell for navigation: {}", key);
                return Ok(shell);
            }
        }

        debug!("No offline fallback for {}: {}", key, error);
        Err(error)
    }

    async fn live_fetch(&self, strategy: &str, request: &RequestDescriptor) -> Result<StoredResponse> {
        let start = Instant::now();
        let result = self.fetcher.fetch(request, Bytes::new()).await;
        self.metrics
            .record_fetch_duration(strategy, start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            self.metrics.record_network_failure(strategy);
            warn!("{} live fetch failed for {}: {}", strategy, request.url, e);
        }
        result
    }

    /// Read `key` from the asset partition; store errors read as a miss
    async fn lookup(&self, key: &str) -> Option<StoredResponse> {
        let result = match self.storage.open(&self.asset_cache).await {
            Ok(partition) => partition.match_key(key).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn store_copy(&self, request: &RequestDescriptor, response: &StoredResponse) {
        let key = request.cache_key();
        if request.is_range_request() || !response.is_cacheable() {
            debug!("Not caching {} (status {})", key, response.status);
            return;
        }

        let copy = response.clone();
        let result = match self.storage.open(&self.asset_cache).await {
            Ok(partition) => partition.put(&key, &copy).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Failed to cache response for {}: {}", key, e);
        }
    }
}
