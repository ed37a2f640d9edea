//! Worker lifecycle: install, activate, and fetch interception
//!
//! The worker moves through a closed set of phases:
//!
//! ```text
//! Parsed -> Installing -> Installed -> Activating -> Activated
//! ```
//!
//! Installation pre-caches the static application shell and moves straight
//! to `Installed` without waiting for older workers. Activation purges every
//! stale cache partition before taking control of requests. Until the worker
//! is `Activated`, every request passes through to the network untouched.

use crate::cache_store::CacheStorage;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::fetcher::Fetcher;
use crate::mailbox::SharedFileMailbox;
use crate::metrics::ProxyMetrics;
use crate::models::{RequestDescriptor, StoredResponse};
use crate::request_classifier::{RequestClassifier, Route};
use crate::share_target::ShareTargetIntake;
use crate::strategies::CacheStrategies;
use bytes::Bytes;
use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

/// Lifecycle phase of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Parsed => "parsed",
            WorkerPhase::Installing => "installing",
            WorkerPhase::Installed => "installed",
            WorkerPhase::Activating => "activating",
            WorkerPhase::Activated => "activated",
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pre-caching the static assets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Assets stored in the asset partition
    pub cached: Vec<String>,
    /// Assets that could not be fetched or returned a non-2xx status
    pub failed: Vec<String>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A request handed to the worker by the interception server
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub descriptor: RequestDescriptor,
    pub body: Bytes,
}

impl InterceptedRequest {
    pub fn new(descriptor: RequestDescriptor, body: Bytes) -> Self {
        InterceptedRequest { descriptor, body }
    }

    /// A body-less request (GET navigations, asset loads)
    pub fn without_body(descriptor: RequestDescriptor) -> Self {
        Self::new(descriptor, Bytes::new())
    }
}

/// What the worker decided for one intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The worker produced the response
    Respond(StoredResponse),
    /// The worker declined; the request goes to the network untouched
    Passthrough,
}

/// The background request-interception worker
///
/// Owns the classifier, the two cache strategies and the share-target
/// intake, and routes every intercepted request to one of them once
/// activated.
///
/// # Example
/// ```no_run
/// use opus2mp3_proxy::{CacheStorage, HttpFetcher, OfflineWorker, ProxyConfig, ProxyMetrics};
/// use std::sync::Arc;
///
/// # async fn run() -> opus2mp3_proxy::Result<()> {
/// let config = Arc::new(ProxyConfig::default());
/// let storage = Arc::new(CacheStorage::new(&config.cache_dir).await?);
/// let fetcher = Arc::new(HttpFetcher::from_config(&config)?);
/// let metrics = Arc::new(ProxyMetrics::new().expect("metrics"));
///
/// let worker = OfflineWorker::new(config, storage, fetcher, metrics)?;
/// worker.install().await?;
/// worker.activate().await?;
/// # Ok(())
/// # }
/// ```
pub struct OfflineWorker {
    config: Arc<ProxyConfig>,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    classifier: RequestClassifier,
    strategies: CacheStrategies,
    intake: ShareTargetIntake,
    metrics: Arc<ProxyMetrics>,
    phase: RwLock<WorkerPhase>,
}

impl OfflineWorker {
    /// Create a worker in the `Parsed` phase
    ///
    /// # Arguments
    /// * `config` - Validated proxy configuration
    /// * `storage` - Cache store shared with the foreground
    /// * `fetcher` - Live network access
    /// * `metrics` - Metrics sink
    pub fn new(
        config: Arc<ProxyConfig>,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        let classifier = RequestClassifier::new(&config);
        let strategies =
            CacheStrategies::new(storage.clone(), fetcher.clone(), &config, metrics.clone())?;
        let mailbox = SharedFileMailbox::new(
            storage.clone(),
            config.shared_files_cache.clone(),
            config.shared_file_key.clone(),
        );
        let intake = ShareTargetIntake::new(mailbox, config.app_root(), metrics.clone());

        Ok(OfflineWorker {
            config,
            storage,
            fetcher,
            classifier,
            strategies,
            intake,
            metrics,
            phase: RwLock::new(WorkerPhase::Parsed),
        })
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> WorkerPhase {
        match self.phase.read() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Move from `from` to `to`, failing if another phase is current
    fn transition(&self, from: WorkerPhase, to: WorkerPhase) -> Result<()> {
        let mut phase = match self.phase.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if *phase != from {
            return Err(ProxyError::InvalidTransition {
                from: phase.to_string(),
                to: to.to_string(),
            });
        }

        debug!("Worker phase: {} -> {}", from, to);
        *phase = to;
        Ok(())
    }

    /// Pre-cache the static application shell
    ///
    /// Each asset is fetched and stored on its own: a failed or non-2xx
    /// asset is logged and reported, the rest are still cached. The worker
    /// becomes `Installed` as soon as the fetches settle.
    ///
    /// # Errors
    /// `InvalidTransition` unless the worker is `Parsed`; a storage error if
    /// the asset partition cannot be opened (the worker returns to `Parsed`).
    pub async fn install(&self) -> Result<InstallReport> {
        self.transition(WorkerPhase::Parsed, WorkerPhase::Installing)?;

        let report = match self.precache().await {
            Ok(report) => report,
            Err(e) => {
                self.transition(WorkerPhase::Installing, WorkerPhase::Parsed)?;
                return Err(e);
            }
        };

        if !report.is_complete() {
            warn!(
                "Failed to cache static assets: cached={}, failed={:?}",
                report.cached.len(),
                report.failed
            );
        }

        self.transition(WorkerPhase::Installing, WorkerPhase::Installed)?;
        info!(
            "Worker installed: cache={}, assets_cached={}",
            self.config.asset_cache_name,
            report.cached.len()
        );
        Ok(report)
    }

    async fn precache(&self) -> Result<InstallReport> {
        let partition = self.storage.open(&self.config.asset_cache_name).await?;
        let urls = self.config.static_asset_urls()?;

        let fetches = urls.into_iter().map(|url| {
            let partition = partition.clone();
            async move {
                let key = url.to_string();
                let request = RequestDescriptor::new(http::Method::GET, url);
                let stored = match self.fetcher.fetch(&request, Bytes::new()).await {
                    Ok(response) if response.is_cacheable() => partition.put(&key, &response).await,
                    Ok(response) => Err(ProxyError::HttpError(format!(
                        "status {}",
                        response.status
                    ))),
                    Err(e) => Err(e),
                };
                (key, stored)
            }
        });

        let mut report = InstallReport::default();
        for (key, stored) in join_all(fetches).await {
            match stored {
                Ok(()) => report.cached.push(key),
                Err(e) => {
                    warn!("Pre-cache failed for {}: {}", key, e);
                    report.failed.push(key);
                }
            }
        }
        Ok(report)
    }

    /// Purge stale partitions and take control of requests
    ///
    /// Every partition other than the current asset cache and the shared-file
    /// cache is deleted, as one batch, before the phase becomes `Activated`.
    ///
    /// # Returns
    /// The names of the deleted partitions, sorted
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.transition(WorkerPhase::Installed, WorkerPhase::Activating)?;

        let stale = match self.purge_stale().await {
            Ok(stale) => stale,
            Err(e) => {
                self.transition(WorkerPhase::Activating, WorkerPhase::Installed)?;
                return Err(e);
            }
        };

        self.transition(WorkerPhase::Activating, WorkerPhase::Activated)?;
        info!("Worker activated: purged={:?}", stale);
        Ok(stale)
    }

    async fn purge_stale(&self) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| {
                name != &self.config.asset_cache_name && name != &self.config.shared_files_cache
            })
            .collect();

        if !stale.is_empty() {
            self.storage.delete_all(&stale).await?;
        }
        Ok(stale)
    }

    /// Decide how one intercepted request is answered
    ///
    /// Strategy errors propagate; the caller turns them into an error
    /// response.
    pub async fn handle_fetch(&self, request: InterceptedRequest) -> Result<FetchOutcome> {
        if self.phase() != WorkerPhase::Activated {
            debug!(
                "Worker not active ({}), passing through: {}",
                self.phase(),
                request.descriptor.url
            );
            return Ok(FetchOutcome::Passthrough);
        }

        let route = self.classifier.classify(&request.descriptor);
        self.metrics.record_request(route.as_str());

        match route {
            Route::ShareTarget => {
                let content_type = request
                    .descriptor
                    .headers
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok());
                let response = self.intake.handle(content_type, request.body.clone()).await;
                Ok(FetchOutcome::Respond(response))
            }
            Route::CacheFirst => self
                .strategies
                .cache_first(&request.descriptor)
                .await
                .map(FetchOutcome::Respond),
            Route::NetworkFirst => self
                .strategies
                .network_first(&request.descriptor)
                .await
                .map(FetchOutcome::Respond),
            Route::Ignore => Ok(FetchOutcome::Passthrough),
        }
    }

    /// Decide how to answer a request whose body could not be read
    ///
    /// A share submission still gets its redirect; anything else fails with
    /// `error`.
    pub fn handle_unreadable(
        &self,
        descriptor: &RequestDescriptor,
        error: ProxyError,
    ) -> Result<StoredResponse> {
        if self.phase() == WorkerPhase::Activated
            && self.classifier.classify(descriptor) == Route::ShareTarget
        {
            self.metrics.record_request(Route::ShareTarget.as_str());
            return Ok(self.intake.reject(&error));
        }
        Err(error)
    }

    /// Forward a request the worker declined straight to the network
    pub async fn passthrough(&self, request: &InterceptedRequest) -> Result<StoredResponse> {
        self.fetcher
            .fetch(&request.descriptor, request.body.clone())
            .await
    }

    /// Absolute URL of `path` under the application root
    pub fn app_url(&self, path: &str) -> Result<Url> {
        self.config.app_url(path)
    }
}
