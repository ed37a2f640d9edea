//! opus2mp3 offline interception proxy
//!
//! The offline caching and request-interception layer of the opus → mp3
//! converter. A local HTTP server sits in front of the application origin,
//! classifies every request, applies a caching policy to it, keeps the
//! application usable offline, and receives files shared from the operating
//! system's share sheet.
//!
//! # Overview
//!
//! Two contexts share one on-disk [`CacheStorage`] and nothing else:
//!
//! - the **background proxy** ([`OfflineWorker`] behind an
//!   [`InterceptionServer`]) pre-caches the application shell, purges stale
//!   cache versions and answers intercepted requests;
//! - the **foreground** ([`ShareRetrieval`], [`Converter`]) picks up a
//!   shared file exactly once and converts it.
//!
//! # Request handling
//!
//! | Request                                   | Policy                        |
//! |-------------------------------------------|-------------------------------|
//! | `POST <base>/?share-target`               | share-target intake, 303      |
//! | any other non-GET                         | passed through untouched      |
//! | GET on a pinned third-party asset         | cache first                   |
//! | any other GET                             | network first, offline shell  |
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use opus2mp3_proxy::{
//!     CacheStorage, HttpFetcher, InterceptionServer, OfflineWorker, ProxyConfig, ProxyMetrics,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(ProxyConfig::from_file("offline_proxy.yaml")?);
//! let storage = Arc::new(CacheStorage::new(&config.cache_dir).await?);
//! let fetcher = Arc::new(HttpFetcher::from_config(&config)?);
//! let metrics = Arc::new(ProxyMetrics::new()?);
//!
//! let worker = Arc::new(OfflineWorker::new(config.clone(), storage, fetcher, metrics)?);
//! worker.install().await?;
//! worker.activate().await?;
//!
//! InterceptionServer::new(worker)
//!     .start(config.listen_address.parse()?)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "127.0.0.1:8080"
//! app_origin: "http://127.0.0.1:3000"
//! base_path: "/audio-converter"
//! cache_dir: "/var/cache/opus2mp3"
//! asset_cache_name: "opus2mp3-v1"
//! share_target_enabled: true
//! ```
//!
//! See [`ProxyConfig`] for every option.

pub mod cache_store;
pub mod codec;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod mailbox;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod request_classifier;
pub mod server;
pub mod share_retrieval;
pub mod share_target;
pub mod strategies;

// Re-export commonly used types
pub use cache_store::{CacheStorage, CacheStorageStats, Partition};
pub use codec::{
    CodecEngine, CodecLoader, CodecProvider, ConversionResult, Converter, LoadStatus, Progress,
    Stage, TranscodeJob,
};
pub use config::{MetricsEndpointConfig, ProxyConfig};
pub use error::{ProxyError, Result};
pub use fetcher::{Fetcher, HttpFetcher};
pub use lifecycle::{FetchOutcome, InstallReport, InterceptedRequest, OfflineWorker, WorkerPhase};
pub use mailbox::SharedFileMailbox;
pub use metrics::ProxyMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{Destination, RequestDescriptor, SharedFile, StoredResponse};
pub use request_classifier::{RequestClassifier, Route};
pub use server::InterceptionServer;
pub use share_retrieval::ShareRetrieval;
pub use share_target::ShareTargetIntake;
pub use strategies::CacheStrategies;
