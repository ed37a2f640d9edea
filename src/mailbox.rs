//! One-slot mailbox carrying a shared file from the proxy to the foreground
//!
//! The slot is a single fixed key in the shared-file partition. Storing
//! overwrites whatever is pending (last writer wins); consuming removes the
//! entry, so a reload never delivers the same share twice.

use crate::cache_store::CacheStorage;
use crate::error::Result;
use crate::models::{SharedFile, StoredResponse};
use std::sync::Arc;
use tracing::debug;

/// Header carrying the original filename of a shared file
pub const FILE_NAME_HEADER: &str = "X-File-Name";

/// MIME type recorded when the sharing app did not provide one
pub const DEFAULT_SHARED_MIME: &str = "audio/opus";

/// Filename reported when the stored entry lacks one
pub const DEFAULT_SHARED_NAME: &str = "audio.opus";

/// Mailbox over the shared-file partition
#[derive(Clone)]
pub struct SharedFileMailbox {
    storage: Arc<CacheStorage>,
    partition: String,
    key: String,
}

impl SharedFileMailbox {
    pub fn new(storage: Arc<CacheStorage>, partition: impl Into<String>, key: impl Into<String>) -> Self {
        SharedFileMailbox {
            storage,
            partition: partition.into(),
            key: key.into(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Put `file` in the slot, replacing any unconsumed file
    pub async fn store(&self, file: &SharedFile) -> Result<()> {
        let mime = if file.mime_type.is_empty() {
            DEFAULT_SHARED_MIME
        } else {
            file.mime_type.as_str()
        };

        let response = StoredResponse::new(200, Vec::new(), file.bytes.clone())
            .with_header("Content-Type", mime)
            .with_header(FILE_NAME_HEADER, &file.name);

        let partition = self.storage.open(&self.partition).await?;
        partition.put(&self.key, &response).await?;
        debug!(
            "Shared file stored: name={}, type={}, size={}",
            file.name,
            mime,
            file.size()
        );
        Ok(())
    }

    /// Read the pending file without consuming it
    pub async fn peek(&self) -> Result<Option<SharedFile>> {
        let partition = self.storage.open(&self.partition).await?;
        Ok(partition.match_key(&self.key).await?.map(decode))
    }

    /// Take the pending file out of the slot
    pub async fn consume(&self) -> Result<Option<SharedFile>> {
        let partition = self.storage.open(&self.partition).await?;
        let file = partition.take(&self.key).await?.map(decode);
        if let Some(file) = &file {
            debug!("Shared file consumed: name={}, size={}", file.name, file.size());
        }
        Ok(file)
    }
}

fn decode(response: StoredResponse) -> SharedFile {
    let name = response
        .header(FILE_NAME_HEADER)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SHARED_NAME)
        .to_string();
    let mime = response.header("content-type").unwrap_or_default().to_string();
    SharedFile::new(name, mime, response.body)
}
