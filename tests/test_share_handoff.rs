//! End-to-end tests for the share-target handoff
//!
//! The proxy runs as a real interception server on an ephemeral port; the
//! foreground side reads the same cache directory through its own store
//! instance.

use bytes::Bytes;
use http_body_util::{Full, StreamBody};
use hyper::body::Frame;
use opus2mp3_proxy::server::handle_request;
use opus2mp3_proxy::{
    CacheStorage, HttpFetcher, InterceptionServer, OfflineWorker, ProxyConfig, ProxyMetrics,
    ShareRetrieval, SharedFileMailbox,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use url::Url;
use wiremock::MockServer;

const BOUNDARY: &str = "----opus2mp3TestBoundary";

fn audio_part(file_name: &str, mime: &str, data: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
        BOUNDARY, file_name, mime
    )
    .into_bytes();
    part.extend_from_slice(data);
    part.extend_from_slice(b"\r\n");
    part
}

fn text_part(name: &str, value: &str) -> Vec<u8> {
    format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
        BOUNDARY, name, value
    )
    .into_bytes()
}

fn finish(mut parts: Vec<u8>) -> Vec<u8> {
    parts.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    parts
}

async fn start_proxy(origin: &MockServer, cache_dir: &Path, base_path: &str) -> (SocketAddr, Arc<OfflineWorker>) {
    let config = Arc::new(ProxyConfig {
        app_origin: origin.uri(),
        base_path: base_path.to_string(),
        cache_dir: cache_dir.to_string_lossy().to_string(),
        ..Default::default()
    });
    let storage = Arc::new(CacheStorage::new(&config.cache_dir).await.unwrap());
    let fetcher = Arc::new(HttpFetcher::new().unwrap());
    let metrics = Arc::new(ProxyMetrics::new().unwrap());
    let worker = Arc::new(OfflineWorker::new(config, storage, fetcher, metrics).unwrap());

    // No assets are mounted; install still completes with an empty cache
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = InterceptionServer::new(worker.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, worker)
}

/// Foreground view of the same cache directory
async fn foreground(cache_dir: &Path) -> ShareRetrieval {
    let storage = Arc::new(CacheStorage::new(cache_dir).await.unwrap());
    let mailbox = SharedFileMailbox::new(storage, "shared-files", "shared-audio-file");
    ShareRetrieval::new(mailbox, true)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_share_round_trip() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (addr, worker) = start_proxy(&origin, dir.path(), "").await;

    let body = finish(audio_part("clip.opus", "audio/ogg", b"OggS\x00\x02opus"));
    let response = client()
        .post(format!("http://{}/?share-target", addr))
        .header("Content-Type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "/?receiving-file-share=true"
    );

    let retrieval = foreground(dir.path()).await;
    let page = Url::parse("http://localhost/?receiving-file-share=true").unwrap();
    let (file, cleaned) = retrieval.check_for_shared_file(&page).await.unwrap();
    assert_eq!(file.name, "clip.opus");
    assert_eq!(file.mime_type, "audio/ogg");
    assert_eq!(&file.bytes[..], b"OggS\x00\x02opus");
    assert_eq!(cleaned.as_str(), "http://localhost/");

    // Consumed exactly once
    assert!(retrieval.retrieve().await.is_none());

    let metrics = worker.metrics();
    assert_eq!(metrics.count(&metrics.requests_total, &["share_target"]), 1);
}

#[tokio::test]
async fn test_share_without_audio_redirects_to_root() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (addr, _) = start_proxy(&origin, dir.path(), "/audio-converter").await;

    let body = finish(text_part("title", "not a file"));
    let response = client()
        .post(format!("http://{}/audio-converter/?share-target", addr))
        .header("Content-Type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(response.headers().get("location").unwrap(), "/audio-converter/");
    assert!(foreground(dir.path()).await.retrieve().await.is_none());
}

#[tokio::test]
async fn test_later_share_replaces_unconsumed_one() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (_, worker) = start_proxy(&origin, dir.path(), "").await;

    for (name, data) in [("first.opus", b"1"), ("second.opus", b"2")] {
        let request = http::Request::post(format!("{}/?share-target", origin.uri()))
            .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Full::new(Bytes::from(finish(audio_part(name, "audio/opus", data)))))
            .unwrap();
        let response = handle_request(&worker, request).await;
        assert_eq!(response.status(), http::StatusCode::SEE_OTHER);
    }

    let retrieval = foreground(dir.path()).await;
    let file = retrieval.retrieve().await.unwrap();
    assert_eq!(file.name, "second.opus");
    assert_eq!(&file.bytes[..], b"2");
    assert!(retrieval.retrieve().await.is_none());
}

#[tokio::test]
async fn test_malformed_share_still_redirects() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (_, worker) = start_proxy(&origin, dir.path(), "").await;

    let request = http::Request::post(format!("{}/?share-target", origin.uri()))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    let response = handle_request(&worker, request).await;

    assert_eq!(response.status(), http::StatusCode::SEE_OTHER);
    assert_eq!(response.headers().get("location").unwrap(), "/");
}

/// Request body that breaks off mid-stream, like a client that went away
fn broken_body() -> StreamBody<futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, std::io::Error>>>> {
    StreamBody::new(futures::stream::iter(vec![
        Ok(Frame::data(Bytes::from(audio_part("clip.opus", "audio/ogg", b"OggS")))),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset")),
    ]))
}

#[tokio::test]
async fn test_unreadable_share_still_redirects() {
    let origin = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (_, worker) = start_proxy(&origin, dir.path(), "/audio-converter").await;

    let request = http::Request::post(format!("{}/audio-converter/?share-target", origin.uri()))
        .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(broken_body())
        .unwrap();
    let response = handle_request(&worker, request).await;

    assert_eq!(response.status(), http::StatusCode::SEE_OTHER);
    assert_eq!(response.headers().get("location").unwrap(), "/audio-converter/");
    assert!(foreground(dir.path()).await.retrieve().await.is_none());

    let metrics = worker.metrics();
    assert_eq!(metrics.count(&metrics.shares_total, &["failed"]), 1);

    // Other routes still report the failure
    let upload = http::Request::post(format!("{}/audio-converter/upload", origin.uri()))
        .body(broken_body())
        .unwrap();
    let response = handle_request(&worker, upload).await;
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_disabled_share_target_never_reads() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(CacheStorage::new(dir.path()).await.unwrap());
    let mailbox = SharedFileMailbox::new(storage, "shared-files", "shared-audio-file");
    mailbox
        .store(&opus2mp3_proxy::SharedFile::new("a.opus", "audio/opus", vec![1]))
        .await
        .unwrap();

    let retrieval = ShareRetrieval::new(mailbox.clone(), false);
    assert!(retrieval.retrieve().await.is_none());
    assert!(mailbox.peek().await.unwrap().is_some());
}
