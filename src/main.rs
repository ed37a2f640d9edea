//! opus2mp3 offline proxy server
//!
//! Loads configuration, sets up logging, installs and activates the worker
//! and serves intercepted requests. The `take-share` sub-command plays the
//! foreground instead: it collects a pending shared file from the store.

use anyhow::{bail, Context};
use opus2mp3_proxy::mailbox::DEFAULT_SHARED_NAME;
use opus2mp3_proxy::{
    CacheStorage, HttpFetcher, InterceptionServer, MetricsEndpoint, OfflineWorker, ProxyConfig,
    ProxyMetrics, ShareRetrieval, SharedFileMailbox,
};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "offline_proxy.yaml";

/// # Usage
/// ```bash
/// # Serve with the default config (offline_proxy.yaml)
/// opus2mp3-proxy
///
/// # Serve with a custom config
/// opus2mp3-proxy /path/to/config.yaml
///
/// # Write a pending shared file into ./incoming
/// opus2mp3-proxy take-share ./incoming [config.yaml]
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("take-share") => {
            let Some(out_dir) = args.get(1) else {
                bail!("usage: opus2mp3-proxy take-share <out-dir> [config.yaml]");
            };
            let config = load_config(args.get(2))?;
            take_share(&config, Path::new(out_dir)).await
        }
        _ => {
            let config = load_config(args.first())?;
            serve(config).await
        }
    }
}

fn load_config(path: Option<&String>) -> anyhow::Result<ProxyConfig> {
    let path = path.map(String::as_str).unwrap_or(DEFAULT_CONFIG);
    info!("Loading configuration from: {}", path);

    let config = ProxyConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path))?;

    info!("Configuration loaded successfully");
    info!("  - Origin: {}{}", config.app_origin, config.base_path);
    info!("  - Cache directory: {}", config.cache_dir);
    info!("  - Asset cache: {}", config.asset_cache_name);
    info!("  - Share target enabled: {}", config.share_target_enabled);
    Ok(config)
}

async fn serve(config: ProxyConfig) -> anyhow::Result<()> {
    info!("Starting opus2mp3 offline proxy");

    let listen: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_address))?;

    let config = Arc::new(config);
    let storage = Arc::new(CacheStorage::new(&config.cache_dir).await?);
    let fetcher = Arc::new(HttpFetcher::from_config(&config)?);
    let metrics = Arc::new(ProxyMetrics::new().context("failed to register metrics")?);

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|m| m.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
        let endpoint = MetricsEndpoint::new(metrics.clone(), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    let worker = Arc::new(OfflineWorker::new(
        config.clone(),
        storage,
        fetcher,
        metrics,
    )?);

    let report = worker.install().await?;
    info!(
        "Install complete: cached={}, failed={}",
        report.cached.len(),
        report.failed.len()
    );
    let purged = worker.activate().await?;
    if !purged.is_empty() {
        info!("Purged stale caches: {:?}", purged);
    }

    InterceptionServer::new(worker).start(listen).await?;
    Ok(())
}

async fn take_share(config: &ProxyConfig, out_dir: &Path) -> anyhow::Result<()> {
    let storage = Arc::new(CacheStorage::new(&config.cache_dir).await?);
    let mailbox = SharedFileMailbox::new(
        storage,
        config.shared_files_cache.clone(),
        config.shared_file_key.clone(),
    );
    let retrieval = ShareRetrieval::new(mailbox, config.share_target_enabled);

    let Some(file) = retrieval.retrieve().await else {
        info!("No shared file pending");
        return Ok(());
    };

    // Keep only the final path component of a name chosen by another app
    let name = Path::new(&file.name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHARED_NAME));
    tokio::fs::create_dir_all(out_dir).await?;
    let target = out_dir.join(name);
    tokio::fs::write(&target, &file.bytes)
        .await
        .with_context(|| format!("failed to write {}", target.display()))?;

    info!(
        "Shared file written: path={}, type={}, size={}",
        target.display(),
        file.mime_type,
        file.size()
    );
    println!("{}", target.display());
    Ok(())
}
