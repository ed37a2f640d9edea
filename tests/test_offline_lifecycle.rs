//! Integration tests for install, activation and the caching strategies
//!
//! A wiremock server stands in for both the application origin and the
//! third-party CDNs. Going offline is simulated by a fetcher wrapper that
//! fails every request while its switch is off.

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use opus2mp3_proxy::{
    CacheStorage, Destination, FetchOutcome, Fetcher, HttpFetcher, InterceptedRequest,
    OfflineWorker, ProxyConfig, ProxyError, ProxyMetrics, RequestDescriptor, Result,
    StoredResponse, WorkerPhase,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Real HTTP fetcher with an "airplane mode" switch
struct SwitchableFetcher {
    inner: HttpFetcher,
    online: AtomicBool,
}

impl SwitchableFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HttpFetcher::new().unwrap(),
            online: AtomicBool::new(true),
        })
    }

    fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for SwitchableFetcher {
    async fn fetch(&self, request: &RequestDescriptor, body: Bytes) -> Result<StoredResponse> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ProxyError::NetworkError("network unreachable".to_string()));
        }
        self.inner.fetch(request, body).await
    }
}

fn test_config(origin: &MockServer, cache_dir: &Path) -> ProxyConfig {
    ProxyConfig {
        app_origin: origin.uri(),
        cache_dir: cache_dir.to_string_lossy().to_string(),
        third_party_assets: vec![format!("{}/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css", origin.uri())],
        ..Default::default()
    }
}

async fn mount_static_assets(origin: &MockServer) {
    for asset in ProxyConfig::default().static_assets {
        Mock::given(method("GET"))
            .and(path(asset.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("asset {}", asset)))
            .expect(1)
            .mount(origin)
            .await;
    }
}

async fn build_worker(
    config: ProxyConfig,
    fetcher: Arc<SwitchableFetcher>,
) -> (Arc<OfflineWorker>, Arc<CacheStorage>) {
    let storage = Arc::new(CacheStorage::new(&config.cache_dir).await.unwrap());
    let metrics = Arc::new(ProxyMetrics::new().unwrap());
    let worker = OfflineWorker::new(Arc::new(config), storage.clone(), fetcher, metrics).unwrap();
    (Arc::new(worker), storage)
}

async fn active_worker(
    origin: &MockServer,
    cache_dir: &Path,
    fetcher: Arc<SwitchableFetcher>,
) -> (Arc<OfflineWorker>, Arc<CacheStorage>) {
    mount_static_assets(origin).await;
    let (worker, storage) = build_worker(test_config(origin, cache_dir), fetcher).await;
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    (worker, storage)
}

async fn fetch(worker: &OfflineWorker, request: RequestDescriptor) -> Result<StoredResponse> {
    match worker.handle_fetch(InterceptedRequest::without_body(request)).await? {
        FetchOutcome::Respond(response) => Ok(response),
        FetchOutcome::Passthrough => panic!("expected the worker to respond"),
    }
}

fn navigation(url: &str) -> RequestDescriptor {
    RequestDescriptor::get(url)
        .unwrap()
        .with_destination(Destination::Document)
}

#[tokio::test]
async fn test_install_precaches_static_assets() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_static_assets(&origin).await;

    let (worker, storage) = build_worker(test_config(&origin, dir.path()), SwitchableFetcher::new()).await;
    let report = worker.install().await.unwrap();

    assert!(report.is_complete());
    assert_eq!(worker.phase(), WorkerPhase::Installed);

    let assets = storage.open("opus2mp3-v1").await.unwrap();
    let keys = assets.keys().await.unwrap();
    assert_eq!(keys.len(), 6);
    let index = assets
        .match_key(&format!("{}/index.html", origin.uri()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&index.body[..], b"asset /index.html");
}

#[tokio::test]
async fn test_install_tolerates_missing_asset() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    // Only the shell is served; every other asset 404s
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&origin)
        .await;

    let (worker, storage) = build_worker(test_config(&origin, dir.path()), SwitchableFetcher::new()).await;
    let report = worker.install().await.unwrap();

    assert_eq!(report.cached, vec![format!("{}/index.html", origin.uri())]);
    assert_eq!(report.failed.len(), 5);
    assert_eq!(worker.phase(), WorkerPhase::Installed);
    assert_eq!(storage.open("opus2mp3-v1").await.unwrap().keys().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_activation_purges_stale_partitions() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let storage = CacheStorage::new(dir.path()).await.unwrap();
    for name in ["opus2mp3-v0", "shared-files", "other"] {
        storage
            .open(name)
            .await
            .unwrap()
            .put("k", &StoredResponse::ok("v"))
            .await
            .unwrap();
    }
    drop(storage);

    let (worker, storage) = active_worker(&origin, dir.path(), SwitchableFetcher::new()).await;

    assert_eq!(worker.phase(), WorkerPhase::Activated);
    assert_eq!(
        storage.keys().await.unwrap(),
        vec!["opus2mp3-v1".to_string(), "shared-files".to_string()]
    );
    // The pending share survives the purge
    assert!(storage.open("shared-files").await.unwrap().match_key("k").await.unwrap().is_some());
}

#[tokio::test]
async fn test_cache_first_fetches_once() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css"))
        .respond_with(ResponseTemplate::new(200).set_body_string("body{}"))
        .expect(1)
        .mount(&origin)
        .await;

    let fetcher = SwitchableFetcher::new();
    let (worker, _) = active_worker(&origin, dir.path(), fetcher.clone()).await;

    let url = format!("{}/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css?v=7", origin.uri());
    let first = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    let second = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    assert_eq!(first.body, second.body);

    // Served from cache with the network gone
    fetcher.go_offline();
    let offline = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    assert_eq!(&offline.body[..], b"body{}");

    let metrics = worker.metrics();
    assert_eq!(metrics.count(&metrics.cache_lookups_total, &["cache_first", "hit"]), 2);
    assert_eq!(metrics.count(&metrics.cache_lookups_total, &["cache_first", "miss"]), 1);
}

#[tokio::test]
async fn test_network_first_writes_through_and_serves_offline() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/assets/app.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("console.log(1)"))
        .mount(&origin)
        .await;

    let fetcher = SwitchableFetcher::new();
    let (worker, storage) = active_worker(&origin, dir.path(), fetcher.clone()).await;

    let url = format!("{}/assets/app.js", origin.uri());
    let live = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    assert_eq!(&live.body[..], b"console.log(1)");
    assert!(storage.open("opus2mp3-v1").await.unwrap().match_key(&url).await.unwrap().is_some());

    fetcher.go_offline();
    let cached = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    assert_eq!(cached, live);
}

#[tokio::test]
async fn test_network_first_does_not_cache_errors() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&origin)
        .await;

    let fetcher = SwitchableFetcher::new();
    let (worker, _) = active_worker(&origin, dir.path(), fetcher.clone()).await;

    let url = format!("{}/api/status", origin.uri());
    let live = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    assert_eq!(live.status, 500);

    fetcher.go_offline();
    let err = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap_err();
    assert!(err.is_network_failure());
}

#[tokio::test]
async fn test_offline_navigation_gets_shell_but_assets_fail() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let fetcher = SwitchableFetcher::new();
    let (worker, _) = active_worker(&origin, dir.path(), fetcher.clone()).await;
    fetcher.go_offline();

    let page = fetch(&worker, navigation(&format!("{}/never-visited", origin.uri())))
        .await
        .unwrap();
    assert_eq!(&page.body[..], b"asset /index.html");

    let script = RequestDescriptor::get(&format!("{}/never-fetched.js", origin.uri())).unwrap();
    let err = fetch(&worker, script).await.unwrap_err();
    assert_eq!(err.to_http_status(), 502);

    let metrics = worker.metrics();
    assert_eq!(metrics.count(&metrics.offline_fallbacks_total, &["shell"]), 1);
}

#[tokio::test]
async fn test_offline_navigation_without_shell_fails() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    // Nothing is mounted, so install caches no shell
    let fetcher = SwitchableFetcher::new();
    let (worker, _) = build_worker(test_config(&origin, dir.path()), fetcher.clone()).await;
    let report = worker.install().await.unwrap();
    assert_eq!(report.cached.len(), 0);
    worker.activate().await.unwrap();
    fetcher.go_offline();

    let err = fetch(&worker, navigation(&format!("{}/never-visited", origin.uri())))
        .await
        .unwrap_err();
    assert!(err.is_network_failure());

    let metrics = worker.metrics();
    assert_eq!(metrics.count(&metrics.offline_fallbacks_total, &["shell"]), 0);
}

#[tokio::test]
async fn test_partial_response_never_served_as_whole() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let asset = "/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css";

    Mock::given(method("GET"))
        .and(path(asset))
        .and(header_exists("range"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-3/6")
                .set_body_bytes(b"body".to_vec()),
        )
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path(asset))
        .respond_with(ResponseTemplate::new(200).set_body_string("body{}"))
        .mount(&origin)
        .await;

    let (worker, storage) = active_worker(&origin, dir.path(), SwitchableFetcher::new()).await;
    let url = format!("{}{}", origin.uri(), asset);

    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::RANGE, "bytes=0-3".parse().unwrap());
    let partial = fetch(&worker, RequestDescriptor::get(&url).unwrap().with_headers(headers))
        .await
        .unwrap();
    assert_eq!(partial.status, 206);
    assert!(storage.open("opus2mp3-v1").await.unwrap().match_key(&url).await.unwrap().is_none());

    let whole = fetch(&worker, RequestDescriptor::get(&url).unwrap()).await.unwrap();
    assert_eq!(whole.status, 200);
    assert_eq!(&whole.body[..], b"body{}");
}

#[tokio::test]
async fn test_redirect_is_returned_and_not_cached() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/app"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/app/"))
        .mount(&origin)
        .await;

    let (worker, storage) = active_worker(&origin, dir.path(), SwitchableFetcher::new()).await;
    let url = format!("{}/app", origin.uri());

    let response = fetch(&worker, navigation(&url)).await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.header("location"), Some("/app/"));
    assert!(storage.open("opus2mp3-v1").await.unwrap().match_key(&url).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_get_passes_through() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (worker, storage) = active_worker(&origin, dir.path(), SwitchableFetcher::new()).await;

    let url = Url::parse(&format!("{}/upload", origin.uri())).unwrap();
    let request = RequestDescriptor::new(Method::POST, url);
    let outcome = worker
        .handle_fetch(InterceptedRequest::new(request, Bytes::from_static(b"x")))
        .await
        .unwrap();

    assert_eq!(outcome, FetchOutcome::Passthrough);
    assert_eq!(storage.open("opus2mp3-v1").await.unwrap().keys().await.unwrap().len(), 6);
}
