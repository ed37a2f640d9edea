//! Share-target intake: decode an OS share-sheet POST into the mailbox

use crate::error::{ProxyError, Result};
use crate::mailbox::{SharedFileMailbox, DEFAULT_SHARED_MIME};
use crate::metrics::ProxyMetrics;
use crate::models::{SharedFile, StoredResponse};
use bytes::Bytes;
use multer::Multipart;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Multipart field carrying the shared audio file
pub const AUDIO_FIELD: &str = "audio";

/// Query flag telling the foreground a share is waiting
pub const RECEIVING_SHARE_PARAM: &str = "receiving-file-share";

/// Redirect status for share submissions (See Other: the follow-up is a GET)
const SEE_OTHER: u16 = 303;

/// Outcome of decoding one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntakeOutcome {
    Stored,
    Empty,
}

/// Decodes share submissions and answers with a redirect into the app
pub struct ShareTargetIntake {
    mailbox: SharedFileMailbox,
    app_root: String,
    metrics: Arc<ProxyMetrics>,
}

impl ShareTargetIntake {
    /// `app_root` is the application root path, ending in '/'
    pub fn new(mailbox: SharedFileMailbox, app_root: impl Into<String>, metrics: Arc<ProxyMetrics>) -> Self {
        ShareTargetIntake {
            mailbox,
            app_root: app_root.into(),
            metrics,
        }
    }

    /// Handle one submission; always answers with a 303 redirect
    ///
    /// The `receiving-file-share` flag is added only when a file was stored.
    pub async fn handle(&self, content_type: Option<&str>, body: Bytes) -> StoredResponse {
        match self.intake(content_type, body).await {
            Ok(IntakeOutcome::Stored) => {
                self.metrics.record_share("stored");
                StoredResponse::redirect(&self.receiving_location(), SEE_OTHER)
            }
            Ok(IntakeOutcome::Empty) => {
                self.metrics.record_share("empty");
                info!("Share submission carried no audio file");
                StoredResponse::redirect(&self.app_root, SEE_OTHER)
            }
            Err(e) => self.reject(&e),
        }
    }

    /// Answer a submission that could not be processed; redirects to the root
    pub fn reject(&self, error: &ProxyError) -> StoredResponse {
        self.metrics.record_share("failed");
        error!("Error handling share target: {}", error);
        StoredResponse::redirect(&self.app_root, SEE_OTHER)
    }

    fn receiving_location(&self) -> String {
        format!("{}?{}=true", self.app_root, RECEIVING_SHARE_PARAM)
    }

    async fn intake(&self, content_type: Option<&str>, body: Bytes) -> Result<IntakeOutcome> {
        let content_type = content_type.ok_or_else(|| {
            ProxyError::MultipartError("share submission without Content-Type".to_string())
        })?;
        let boundary = multer::parse_boundary(content_type)?;

        let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(body) });
        let mut multipart = Multipart::new(stream, boundary);

        while let Some(field) = multipart.next_field().await? {
            if field.name() != Some(AUDIO_FIELD) {
                continue;
            }

            // Only the first audio value counts, file or not
            let Some(name) = field.file_name().map(str::to_string) else {
                warn!("First '{}' field is not a file, ignoring submission", AUDIO_FIELD);
                return Ok(IntakeOutcome::Empty);
            };
            let mime = field
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_else(|| DEFAULT_SHARED_MIME.to_string());
            let bytes = field.bytes().await?;

            let file = SharedFile::new(name, mime, bytes);
            self.mailbox.store(&file).await?;
            info!(
                "Shared file received: name={}, type={}, size={}",
                file.name,
                file.mime_type,
                file.size()
            );
            return Ok(IntakeOutcome::Stored);
        }

        Ok(IntakeOutcome::Empty)
    }
}
