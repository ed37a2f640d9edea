//! Prometheus metrics for the interception proxy
//!
//! Every `ProxyMetrics` owns its own registry so several proxies (or tests)
//! can live in one process without name clashes.

use prometheus::{CounterVec, Encoder, HistogramVec, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collected by the proxy
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Requests intercepted, by route
    pub requests_total: Arc<CounterVec>,

    /// Cache lookups, by strategy and result (hit/miss)
    pub cache_lookups_total: Arc<CounterVec>,

    /// Live fetches that could not reach the network, by strategy
    pub network_failures_total: Arc<CounterVec>,

    /// Offline fallbacks served, by kind (cached/shell)
    pub offline_fallbacks_total: Arc<CounterVec>,

    /// Share handoffs, by outcome (stored/empty/failed/consumed)
    pub shares_total: Arc<CounterVec>,

    /// Live fetch duration, by strategy
    pub fetch_duration_seconds: Arc<HistogramVec>,
}

impl ProxyMetrics {
    /// Create metrics on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered on `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            prometheus::Opts::new(
                "opus2mp3_proxy_requests_total",
                "Total number of intercepted requests",
            ),
            &["route"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cache_lookups_total = CounterVec::new(
            prometheus::Opts::new(
                "opus2mp3_proxy_cache_lookups_total",
                "Total number of cache lookups by result",
            ),
            &["strategy", "result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let network_failures_total = CounterVec::new(
            prometheus::Opts::new(
                "opus2mp3_proxy_network_failures_total",
                "Total number of live fetches that failed to reach the network",
            ),
            &["strategy"],
        )?;
        registry.register(Box::new(network_failures_total.clone()))?;

        let offline_fallbacks_total = CounterVec::new(
            prometheus::Opts::new(
                "opus2mp3_proxy_offline_fallbacks_total",
                "Total number of responses served from cache because the network failed",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(offline_fallbacks_total.clone()))?;

        let shares_total = CounterVec::new(
            prometheus::Opts::new(
                "opus2mp3_proxy_shares_total",
                "Total number of share-target submissions by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(shares_total.clone()))?;

        let fetch_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "opus2mp3_proxy_fetch_duration_seconds",
                "Duration of live fetches in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["strategy"],
        )?;
        registry.register(Box::new(fetch_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total: Arc::new(requests_total),
            cache_lookups_total: Arc::new(cache_lookups_total),
            network_failures_total: Arc::new(network_failures_total),
            offline_fallbacks_total: Arc::new(offline_fallbacks_total),
            shares_total: Arc::new(shares_total),
            fetch_duration_seconds: Arc::new(fetch_duration_seconds),
        })
    }

    pub fn record_request(&self, route: &str) {
        self.requests_total.with_label_values(&[route]).inc();
    }

    pub fn record_cache_lookup(&self, strategy: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[strategy, result])
            .inc();
    }

    pub fn record_network_failure(&self, strategy: &str) {
        self.network_failures_total
            .with_label_values(&[strategy])
            .inc();
    }

    pub fn record_offline_fallback(&self, kind: &str) {
        self.offline_fallbacks_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_share(&self, outcome: &str) {
        self.shares_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_fetch_duration(&self, strategy: &str, duration_secs: f64) {
        self.fetch_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    /// Current value of one counter, for diagnostics and tests
    pub fn count(&self, counter: &CounterVec, labels: &[&str]) -> u64 {
        counter.with_label_values(labels).get() as u64
    }

    /// Encode every metric in Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
