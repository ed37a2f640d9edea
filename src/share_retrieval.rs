//! Foreground side of the share-target handoff

use crate::mailbox::SharedFileMailbox;
use crate::metrics::ProxyMetrics;
use crate::models::SharedFile;
use crate::request_classifier::SHARE_TARGET_PARAM;
use crate::share_target::RECEIVING_SHARE_PARAM;
use std::sync::Arc;
use tracing::{debug, error, info};
use url::Url;

/// Consumes the shared file left behind by the share-target intake
pub struct ShareRetrieval {
    mailbox: SharedFileMailbox,
    enabled: bool,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ShareRetrieval {
    /// `enabled` is the platform capability flag; when false nothing is read
    pub fn new(mailbox: SharedFileMailbox, enabled: bool) -> Self {
        ShareRetrieval {
            mailbox,
            enabled,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Take the pending shared file, if any
    ///
    /// The entry is deleted as part of the read, so a second call (or a page
    /// reload) returns `None`. Storage failures are logged and read as
    /// nothing pending.
    pub async fn retrieve(&self) -> Option<SharedFile> {
        if !self.enabled {
            debug!("Share target unsupported, skipping retrieval");
            return None;
        }

        match self.mailbox.consume().await {
            Ok(Some(file)) => {
                info!("Retrieved shared file: name={}, size={}", file.name, file.size());
                if let Some(metrics) = &self.metrics {
                    metrics.record_share("consumed");
                }
                Some(file)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Error retrieving shared file: {}", e);
                None
            }
        }
    }

    /// Whether the page URL says a share is on its way
    pub fn has_pending_share(&self, page: &Url) -> bool {
        page.query_pairs()
            .any(|(k, _)| k == SHARE_TARGET_PARAM || k == RECEIVING_SHARE_PARAM)
    }

    /// `page` with both share markers removed; other parameters keep their order
    pub fn clear_share_params(&self, page: &Url) -> Url {
        let kept: Vec<(String, String)> = page
            .query_pairs()
            .filter(|(k, _)| k != SHARE_TARGET_PARAM && k != RECEIVING_SHARE_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut cleaned = page.clone();
        if kept.is_empty() {
            cleaned.set_query(None);
        } else {
            cleaned.query_pairs_mut().clear().extend_pairs(kept);
        }
        cleaned
    }

    /// Page-load check: retrieve when the URL is marked, and clean the URL
    ///
    /// Returns the file together with the cleaned URL. An unmarked URL is
    /// never checked against the store.
    pub async fn check_for_shared_file(&self, page: &Url) -> Option<(SharedFile, Url)> {
        if !self.has_pending_share(page) {
            return None;
        }

        let file = self.retrieve().await?;
        Some((file, self.clear_share_params(page)))
    }
}
