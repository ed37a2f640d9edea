//! Request classification: which handling policy applies to a request

use crate::config::ProxyConfig;
use crate::models::RequestDescriptor;
use http::Method;
use tracing::debug;

/// Query parameter marking a share-target submission
pub const SHARE_TARGET_PARAM: &str = "share-target";

/// Handling policy chosen for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// OS share-sheet submission; decoded by the share-target intake
    ShareTarget,
    /// Live network first, cache as fallback
    NetworkFirst,
    /// Cache first, live network to populate
    CacheFirst,
    /// Not handled; the request goes to the network untouched
    Ignore,
}

impl Route {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::ShareTarget => "share_target",
            Route::NetworkFirst => "network_first",
            Route::CacheFirst => "cache_first",
            Route::Ignore => "ignore",
        }
    }
}

/// Stateless request classifier
///
/// Rules, in order:
/// 1. POST to the application root with `?share-target` → `ShareTarget`
/// 2. any other non-GET → `Ignore`
/// 3. URL prefixed by a third-party allow-list entry (the entry's own query
///    string removed) → `CacheFirst`
/// 4. everything else → `NetworkFirst`
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    share_path: String,
    third_party_prefixes: Vec<String>,
}

impl RequestClassifier {
    /// Create a classifier for the given configuration
    pub fn new(config: &ProxyConfig) -> Self {
        RequestClassifier {
            share_path: config.app_root(),
            third_party_prefixes: config
                .third_party_assets
                .iter()
                .map(|asset| strip_query(asset).to_string())
                .collect(),
        }
    }

    /// Decide which policy applies to `request`
    pub fn classify(&self, request: &RequestDescriptor) -> Route {
        let route = self.route_for(request);
        debug!(
            "Classified request: method={}, url={}, route={}",
            request.method,
            request.url,
            route.as_str()
        );
        route
    }

    fn route_for(&self, request: &RequestDescriptor) -> Route {
        if request.method == Method::POST
            && request.path() == self.share_path
            && request.has_query_param(SHARE_TARGET_PARAM)
        {
            return Route::ShareTarget;
        }

        if request.method != Method::GET {
            return Route::Ignore;
        }

        if self.is_third_party_asset(request.url.as_str()) {
            return Route::CacheFirst;
        }

        Route::NetworkFirst
    }

    /// Whether `url` falls under the third-party allow-list
    pub fn is_third_party_asset(&self, url: &str) -> bool {
        self.third_party_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
