//! Persistent, partitioned response store
//!
//! The store is a directory on disk holding one sub-directory per named
//! partition. Each partition maps a string key (a request URL or a fixed
//! literal) to a stored response. Because every read and write goes to disk,
//! two independent processes opening the same root see the same contents,
//! which is what lets the background proxy hand a shared file to the
//! foreground.
//!
//! Layout:
//! ```text
//! <root>/
//!   p-<xxh3(name)>/
//!     PARTITION              partition name
//!     <xxh3(key)>.entry      bincode record + crc32 trailer
//!   .dead-p-<...>            partition being deleted, invisible
//! ```
//!
//! Entries are written to a temporary file, synced, then renamed into place,
//! so a reader sees either the previous entry or the new one.

use crate::error::{ProxyError, Result};
use crate::models::{EntryRecord, StoredResponse};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

const PARTITION_PREFIX: &str = "p-";
const TOMBSTONE_PREFIX: &str = ".dead-";
const NAME_FILE: &str = "PARTITION";
const ENTRY_EXTENSION: &str = "entry";
const CRC_LEN: usize = 4;

/// Source of unique suffixes for temporary and claimed files
static UNIQUE: AtomicU64 = AtomicU64::new(0);

fn unique_suffix() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        UNIQUE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStorageStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub corrupt_entries: u64,
    pub partitions_deleted: u64,
}

type SharedStats = Arc<RwLock<CacheStorageStats>>;

fn bump(stats: &SharedStats, update: impl FnOnce(&mut CacheStorageStats)) {
    if let Ok(mut stats) = stats.write() {
        update(&mut stats);
    }
}

/// Root of the persistent store
pub struct CacheStorage {
    root: PathBuf,
    stats: SharedStats,
}

impl CacheStorage {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// Tombstones left behind by an interrupted partition deletion are
    /// removed here.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to create cache root {}: {}",
                root.display(),
                e
            ))
        })?;

        let storage = CacheStorage {
            root,
            stats: Arc::new(RwLock::new(CacheStorageStats::default())),
        };
        storage.sweep_tombstones().await;

        info!("Opened cache store at {}", storage.root.display());
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}{:016x}", PARTITION_PREFIX, xxh3_64(name.as_bytes())))
    }

    /// Open a partition, creating it when it does not exist
    pub async fn open(&self, name: &str) -> Result<Partition> {
        if name.is_empty() {
            return Err(ProxyError::CacheError(
                "partition name must not be empty".to_string(),
            ));
        }

        let partition = Partition {
            name: name.to_string(),
            dir: self.partition_dir(name),
            stats: Arc::clone(&self.stats),
        };
        partition.ensure_exists().await?;
        Ok(partition)
    }

    /// Whether a partition with this name exists
    pub async fn has(&self, name: &str) -> Result<bool> {
        let marker = self.partition_dir(name).join(NAME_FILE);
        Ok(fs::try_exists(&marker).await?)
    }

    /// Names of all live partitions, sorted
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.starts_with(PARTITION_PREFIX) {
                continue;
            }

            match fs::read_to_string(entry.path().join(NAME_FILE)).await {
                Ok(name) => names.push(name),
                Err(e) => {
                    debug!("Skipping partition dir without name file {}: {}", file_name, e);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Delete one partition and every entry in it
    ///
    /// Returns `false` when no such partition exists.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let deleted = self.delete_all(&[name.to_string()]).await?;
        Ok(deleted == 1)
    }

    /// Delete several partitions as one batch
    ///
    /// Every partition is first renamed to a hidden tombstone, so once this
    /// returns none of them is visible to `keys`, `has` or `open` lookups.
    /// The tombstones are then removed from disk.
    pub async fn delete_all(&self, names: &[String]) -> Result<usize> {
        let mut tombstones = Vec::with_capacity(names.len());

        for name in names {
            let dir = self.partition_dir(name);
            let tombstone = self.root.join(format!(
                "{}{}-{}",
                TOMBSTONE_PREFIX,
                dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                unique_suffix()
            ));

            match fs::rename(&dir, &tombstone).await {
                Ok(()) => tombstones.push((name.clone(), tombstone)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Partition already gone: {}", name);
                }
                Err(e) => {
                    return Err(ProxyError::CacheError(format!(
                        "Failed to delete partition {}: {}",
                        name, e
                    )));
                }
            }
        }

        for (name, tombstone) in &tombstones {
            if let Err(e) = fs::remove_dir_all(tombstone).await {
                warn!("Failed to remove tombstone for partition {}: {}", name, e);
            } else {
                debug!("Deleted partition: {}", name);
            }
        }

        let count = tombstones.len();
        bump(&self.stats, |s| s.partitions_deleted += count as u64);
        Ok(count)
    }

    /// Look up `key` in every partition, in name order
    pub async fn match_any(&self, key: &str) -> Result<Option<StoredResponse>> {
        for name in self.keys().await? {
            let partition = Partition {
                dir: self.partition_dir(&name),
                name,
                stats: Arc::clone(&self.stats),
            };
            if let Some(response) = partition.match_key(key).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Get store statistics
    pub fn get_stats(&self) -> CacheStorageStats {
        self.stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    async fn sweep_tombstones(&self) {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Failed to scan cache root for tombstones: {}", e);
                return;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(TOMBSTONE_PREFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    warn!("Failed to remove stale tombstone {}: {}", entry.path().display(), e);
                }
            }
        }
    }
}

/// Handle to one named partition
#[derive(Clone)]
pub struct Partition {
    name: String,
    dir: PathBuf,
    stats: SharedStats,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> Result<()> {
        let marker = self.dir.join(NAME_FILE);
        if fs::try_exists(&marker).await? {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to create partition {}: {}",
                self.name, e
            ))
        })?;
        write_atomically(&self.dir, &marker, self.name.as_bytes()).await?;
        debug!("Created partition: {}", self.name);
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{:016x}.{}", xxh3_64(key.as_bytes()), ENTRY_EXTENSION))
    }

    /// Look up the response stored under `key`
    pub async fn match_key(&self, key: &str) -> Result<Option<StoredResponse>> {
        let path = self.entry_path(key);

        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bump(&self.stats, |s| s.misses += 1);
                debug!("Cache miss: partition={}, key={}", self.name, key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match decode_entry(&raw) {
            Ok(record) if record.key == key => {
                bump(&self.stats, |s| s.hits += 1);
                debug!("Cache hit: partition={}, key={}", self.name, key);
                Ok(Some(record.into_response()))
            }
            Ok(record) => {
                // xxh3 collision: a different key owns this slot
                debug!(
                    "Cache slot taken by another key: partition={}, key={}, stored={}",
                    self.name, key, record.key
                );
                bump(&self.stats, |s| s.misses += 1);
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Dropping corrupt cache entry: partition={}, key={}, error={}",
                    self.name, key, e
                );
                let _ = fs::remove_file(&path).await;
                bump(&self.stats, |s| {
                    s.corrupt_entries += 1;
                    s.misses += 1;
                });
                Ok(None)
            }
        }
    }

    /// Store `response` under `key`, replacing any previous entry wholesale
    pub async fn put(&self, key: &str, response: &StoredResponse) -> Result<()> {
        self.ensure_exists().await?;

        let encoded = encode_entry(&EntryRecord::from_response(key, response))?;
        write_atomically(&self.dir, &self.entry_path(key), &encoded).await?;

        bump(&self.stats, |s| s.writes += 1);
        debug!(
            "Stored entry: partition={}, key={}, status={}, size={}",
            self.name,
            key,
            response.status,
            response.body.len()
        );
        Ok(())
    }

    /// Remove the entry stored under `key`
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {
                bump(&self.stats, |s| s.deletes += 1);
                debug!("Deleted entry: partition={}, key={}", self.name, key);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and remove the entry under `key` in one step
    ///
    /// The entry file is first renamed to a private claim file; only the
    /// caller whose rename succeeds gets the entry, so concurrent takers
    /// (even in different processes) never both receive it.
    pub async fn take(&self, key: &str) -> Result<Option<StoredResponse>> {
        let path = self.entry_path(key);
        let claim = self.dir.join(format!(
            ".{}.claim-{}",
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            unique_suffix()
        ));

        match fs::rename(&path, &claim).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bump(&self.stats, |s| s.misses += 1);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let raw = fs::read(&claim).await;
        let _ = fs::remove_file(&claim).await;
        let raw = raw?;

        match decode_entry(&raw) {
            Ok(record) if record.key == key => {
                bump(&self.stats, |s| {
                    s.hits += 1;
                    s.deletes += 1;
                });
                debug!("Took entry: partition={}, key={}", self.name, key);
                Ok(Some(record.into_response()))
            }
            Ok(record) => {
                warn!(
                    "Claimed entry belonged to another key: partition={}, key={}, stored={}",
                    self.name, key, record.key
                );
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Dropping corrupt cache entry: partition={}, key={}, error={}",
                    self.name, key, e
                );
                bump(&self.stats, |s| s.corrupt_entries += 1);
                Ok(None)
            }
        }
    }

    /// Keys of every readable entry in this partition, sorted
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Ok(raw) = fs::read(&path).await {
                if let Ok(record) = decode_entry(&raw) {
                    keys.push(record.key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

fn encode_entry(record: &EntryRecord) -> Result<Vec<u8>> {
    let mut encoded = bincode::serialize(record)?;
    let crc = crc32fast::hash(&encoded);
    encoded.extend_from_slice(&crc.to_le_bytes());
    Ok(encoded)
}

fn decode_entry(raw: &[u8]) -> Result<EntryRecord> {
    if raw.len() < CRC_LEN {
        return Err(ProxyError::CorruptEntry(format!(
            "entry too short: {} bytes",
            raw.len()
        )));
    }

    let (payload, trailer) = raw.split_at(raw.len() - CRC_LEN);
    let mut crc_bytes = [0u8; CRC_LEN];
    crc_bytes.copy_from_slice(trailer);
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32fast::hash(payload);

    if expected != actual {
        return Err(ProxyError::CorruptEntry(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

async fn write_atomically(dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".write-{}.tmp", unique_suffix()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, target).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(ProxyError::CacheError(format!(
            "Failed to write {}: {}",
            target.display(),
            e
        )));
    }

    Ok(())
}
