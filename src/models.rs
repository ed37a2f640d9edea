//! Core data models for the offline interception proxy

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use url::Url;

/// What the requester intends to do with the response
///
/// Derived from the `Sec-Fetch-Dest` request header. Only `Document` changes
/// behavior: it makes a request eligible for the offline shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Destination {
    /// Full-page navigation
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    /// fetch()/XHR and anything unlabelled
    #[default]
    Empty,
    Other,
}

impl Destination {
    /// Parse a `Sec-Fetch-Dest` header value
    pub fn from_fetch_dest(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" | "iframe" | "frame" => Destination::Document,
            "script" | "worker" | "sharedworker" | "serviceworker" => Destination::Script,
            "style" => Destination::Style,
            "image" => Destination::Image,
            "font" => Destination::Font,
            "manifest" => Destination::Manifest,
            "empty" | "" => Destination::Empty,
            _ => Destination::Other,
        }
    }

    /// Derive the destination from request headers
    ///
    /// Falls back to `Sec-Fetch-Mode: navigate` for clients that do not send
    /// `Sec-Fetch-Dest`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
            return Destination::from_fetch_dest(dest);
        }

        let navigating = headers
            .get("sec-fetch-mode")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("navigate"))
            .unwrap_or(false);

        if navigating {
            Destination::Document
        } else {
            Destination::Empty
        }
    }
}

/// An incoming request as seen by the classifier and the strategies
///
/// Derived fresh for every request and never persisted.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub destination: Destination,
}

impl RequestDescriptor {
    /// Create a descriptor with no headers
    pub fn new(method: Method, url: Url) -> Self {
        RequestDescriptor {
            method,
            url,
            headers: HeaderMap::new(),
            destination: Destination::Empty,
        }
    }

    /// Parse an absolute URL into a GET descriptor
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid url {}: {}", url, e)))?;
        Ok(Self::new(Method::GET, url))
    }

    /// Attach request headers; the destination is re-derived from them
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.destination = Destination::from_headers(&headers);
        self.headers = headers;
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Serialized origin, e.g. `https://example.com`
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Whether the query string carries `name`, with or without a value
    pub fn has_query_param(&self, name: &str) -> bool {
        self.url.query_pairs().any(|(key, _)| key == name)
    }

    pub fn is_navigation(&self) -> bool {
        self.destination == Destination::Document
    }

    /// Whether the requester asked for part of the resource
    pub fn is_range_request(&self) -> bool {
        self.headers.contains_key(http::header::RANGE)
    }

    /// Identity used to key this request in a cache partition
    ///
    /// The absolute URL without its fragment; the query string is part of
    /// the identity.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.to_string()
    }
}

/// A response as stored in, or served from, the cache store
///
/// Immutable once stored: updates replace the whole entry. Cloning only bumps
/// the body's reference count, so a strategy can keep one copy for the store
/// and hand the other to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    /// Ordered header list; names compared case-insensitively
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StoredResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        StoredResponse {
            status,
            headers,
            body,
        }
    }

    /// A 200 response with the given body and no headers
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, Vec::new(), body.into())
    }

    /// An empty-bodied redirect to `location`
    pub fn redirect(location: &str, status: u16) -> Self {
        Self::new(
            status,
            vec![("Location".to_string(), location.to_string())],
            Bytes::new(),
        )
    }

    /// Whether the status is in the 2xx range
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether a copy may be stored under the full-resource key
    ///
    /// 2xx except 206: a partial body is never a stand-in for the whole.
    pub fn is_cacheable(&self) -> bool {
        self.is_ok() && self.status != 206
    }

    /// First value of header `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Builder-style header append
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Serialized form of a stored response, as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryRecord {
    pub key: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl EntryRecord {
    pub fn from_response(key: &str, response: &StoredResponse) -> Self {
        EntryRecord {
            key: key.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.to_vec(),
        }
    }

    pub fn into_response(self) -> StoredResponse {
        StoredResponse::new(self.status, self.headers, Bytes::from(self.body))
    }
}

/// A file handed to the application through the OS share sheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Original filename as provided by the sharing app
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl SharedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        SharedFile {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Lowercased extension including the dot, e.g. `.opus`
    pub fn extension(&self) -> Option<String> {
        self.name
            .rfind('.')
            .map(|idx| self.name[idx..].to_ascii_lowercase())
    }
}
