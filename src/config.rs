//! Configuration management for the offline interception proxy

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

/// Configuration for the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the interception server listens on (default: 127.0.0.1:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Origin serving the application's own files (default: http://127.0.0.1:3000)
    #[serde(default = "default_app_origin")]
    pub app_origin: String,

    /// Sub-path the application is deployed under, e.g. "/audio-converter".
    /// Empty when deployed at the origin root.
    #[serde(default)]
    pub base_path: String,

    /// Root directory of the persistent cache store
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Name of the versioned asset partition. Bump on deploy to invalidate
    /// every previously cached asset.
    #[serde(default = "default_asset_cache_name")]
    pub asset_cache_name: String,

    /// Name of the unversioned partition holding a pending shared file
    #[serde(default = "default_shared_files_cache")]
    pub shared_files_cache: String,

    /// Fixed key of the pending shared file
    #[serde(default = "default_shared_file_key")]
    pub shared_file_key: String,

    /// First-party assets pre-cached at install, relative to `base_path`
    #[serde(default = "default_static_assets")]
    pub static_assets: Vec<String>,

    /// Third-party URLs served cache-first; matched by prefix with their own
    /// query string ignored
    #[serde(default = "default_third_party_assets")]
    pub third_party_assets: Vec<String>,

    /// Document served to offline navigations, relative to `base_path`
    #[serde(default = "default_offline_shell")]
    pub offline_shell: String,

    /// Whether the share-target feature is available to the foreground
    #[serde(default = "default_true")]
    pub share_target_enabled: bool,

    /// Optional live fetch timeout in seconds. No timeout when unset.
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_app_origin() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_cache_dir() -> String {
    "/var/cache/opus2mp3".to_string()
}

fn default_asset_cache_name() -> String {
    "opus2mp3-v1".to_string()
}

fn default_shared_files_cache() -> String {
    "shared-files".to_string()
}

fn default_shared_file_key() -> String {
    "shared-audio-file".to_string()
}

fn default_static_assets() -> Vec<String> {
    [
        "/",
        "/index.html",
        "/manifest.json",
        "/assets/styles/custom.css",
        "/assets/icons/icon-192.png",
        "/assets/icons/icon-512.png",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_third_party_assets() -> Vec<String> {
    [
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
        "https://cdn.jsdelivr.net/npm/bootstrap-icons@1.11.2/font/bootstrap-icons.min.css",
        "https://unpkg.com/@ffmpeg/core@0.12.6/dist/esm/ffmpeg-core.js",
        "https://unpkg.com/@ffmpeg/core@0.12.6/dist/esm/ffmpeg-core.wasm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_shell() -> String {
    "/index.html".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            app_origin: default_app_origin(),
            base_path: String::new(),
            cache_dir: default_cache_dir(),
            asset_cache_name: default_asset_cache_name(),
            shared_files_cache: default_shared_files_cache(),
            shared_file_key: default_shared_file_key(),
            static_assets: default_static_assets(),
            third_party_assets: default_third_party_assets(),
            offline_shell: default_offline_shell(),
            share_target_enabled: default_true(),
            fetch_timeout_secs: None,
            metrics_endpoint: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - app_origin must be an http(s) URL
    /// - base_path must be empty or start with '/' and not end with '/'
    /// - partition names must be non-empty and distinct
    /// - shared_file_key must be non-empty
    /// - third-party assets must be absolute URLs
    /// - fetch_timeout_secs, when set, must be > 0
    pub fn validate(&self) -> Result<()> {
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            ProxyError::ConfigError(format!(
                "listen_address '{}' is not a socket address: {}",
                self.listen_address, e
            ))
        })?;

        let origin = Url::parse(&self.app_origin).map_err(|e| {
            ProxyError::ConfigError(format!("app_origin '{}' is invalid: {}", self.app_origin, e))
        })?;
        if origin.scheme() != "http" && origin.scheme() != "https" {
            return Err(ProxyError::ConfigError(format!(
                "app_origin must use http or https, got '{}'",
                origin.scheme()
            )));
        }

        if !self.base_path.is_empty()
            && (!self.base_path.starts_with('/') || self.base_path.ends_with('/'))
        {
            return Err(ProxyError::ConfigError(format!(
                "base_path must start with '/' and must not end with '/', got '{}'",
                self.base_path
            )));
        }

        if self.asset_cache_name.is_empty() || self.shared_files_cache.is_empty() {
            return Err(ProxyError::ConfigError(
                "cache partition names must not be empty".to_string(),
            ));
        }

        if self.asset_cache_name == self.shared_files_cache {
            return Err(ProxyError::ConfigError(format!(
                "asset_cache_name and shared_files_cache must differ, both are '{}'",
                self.asset_cache_name
            )));
        }

        if self.shared_file_key.is_empty() {
            return Err(ProxyError::ConfigError(
                "shared_file_key must not be empty".to_string(),
            ));
        }

        for asset in &self.third_party_assets {
            Url::parse(asset).map_err(|e| {
                ProxyError::ConfigError(format!("third-party asset '{}' is invalid: {}", asset, e))
            })?;
        }

        if self.fetch_timeout_secs == Some(0) {
            return Err(ProxyError::ConfigError(
                "fetch_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }

        if let Some(metrics) = &self.metrics_endpoint {
            if metrics.enabled {
                metrics.address.parse::<SocketAddr>().map_err(|e| {
                    ProxyError::ConfigError(format!(
                        "metrics address '{}' is not a socket address: {}",
                        metrics.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Application root path, always ending in '/'
    pub fn app_root(&self) -> String {
        format!("{}/", self.base_path)
    }

    /// Absolute URL of a first-party path, prefixed with `base_path`
    pub fn app_url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}{}{}",
            self.app_origin.trim_end_matches('/'),
            self.base_path,
            path
        );
        Url::parse(&joined).map_err(|e| {
            ProxyError::ConfigError(format!("invalid application url '{}': {}", joined, e))
        })
    }

    /// Absolute URLs of every static asset pre-cached at install
    pub fn static_asset_urls(&self) -> Result<Vec<Url>> {
        self.static_assets.iter().map(|path| self.app_url(path)).collect()
    }

    /// Absolute URL of the offline shell document
    pub fn offline_shell_url(&self) -> Result<Url> {
        self.app_url(&self.offline_shell)
    }
}
