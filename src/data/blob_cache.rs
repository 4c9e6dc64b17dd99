//! Persistent blob cache validated against remote modification time
//!
//! The whole cache is one gzip-compressed bincode file. It is read once when
//! the cache is opened and rewritten in full after every download. Freshness
//! is decided only by comparing modification times, never by local age.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BlobProperties, BlobRef, BlobStore, FetchError};

/// Cached blob content with the metadata it was downloaded under
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    data: Bytes,
    properties: BlobProperties,
}

type Entries = BTreeMap<String, CacheEntry>;

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct BlobCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    downloads: AtomicU64,
    writes: AtomicU64,
}

impl BlobCacheStats {
    /// Requests served from the local copy
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cached requests that had to download
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Full-content downloads, cached or not
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Successful cache file writes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Blob cache in front of a [`BlobStore`]
pub struct BlobCache {
    store: Arc<dyn BlobStore>,
    path: PathBuf,
    entries: Mutex<Entries>,
    stats: BlobCacheStats,
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("path", &self.path)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl BlobCache {
    /// Open the cache persisted at `path`.
    ///
    /// A missing file starts empty. An unreadable one is logged and also
    /// starts empty; it is replaced on the next write.
    pub fn open(store: Arc<dyn BlobStore>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load_entries(&path) {
            Ok(Some(entries)) => {
                info!(path = %path.display(), entries = entries.len(), "Loaded blob cache");
                entries
            }
            Ok(None) => Entries::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable blob cache");
                Entries::new()
            }
        };

        Self {
            store,
            path,
            entries: Mutex::new(entries),
            stats: BlobCacheStats::default(),
        }
    }

    /// Cache file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Statistics
    #[must_use]
    pub fn stats(&self) -> &BlobCacheStats {
        &self.stats
    }

    /// Number of cached blobs
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is cached
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Content of `blob`.
    ///
    /// With `use_cache` the remote metadata is always checked and the local
    /// copy is served only if it is at least as new as the remote one;
    /// otherwise the blob is downloaded, cached and the cache file rewritten.
    /// Without `use_cache` the blob is downloaded and the cache is neither
    /// read nor written.
    pub async fn get(&self, blob: &BlobRef, use_cache: bool) -> Result<Bytes, FetchError> {
        if !use_cache {
            debug!(blob = %blob, "Loading blob from store, cache bypassed");
            self.stats.downloads.fetch_add(1, Ordering::Relaxed);
            return self.store.download(blob).await;
        }

        let key = blob.cache_key();
        let remote = self.store.get_metadata(blob).await?;

        if let Some(entry) = self.entries.lock().await.get(&key) {
            if remote.last_modified <= entry.properties.last_modified {
                debug!(blob = %blob, "Loading blob from cache");
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.data.clone());
            }
            debug!(
                blob = %blob,
                cached = %entry.properties.last_modified,
                remote = %remote.last_modified,
                "Cached blob is stale"
            );
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);
        info!(blob = %blob, "Loading blob from store and caching");
        let data = self.store.download(blob).await?;

        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                data: data.clone(),
                properties: remote,
            },
        );
        match self.persist(&entries).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to write blob cache"),
        }

        Ok(data)
    }

    /// Rewrite the cache file: temporary sibling, then rename into place
    async fn persist(&self, entries: &Entries) -> std::io::Result<()> {
        let encoded = encode_entries(entries)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

fn encode_entries(entries: &Entries) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let serialized = bincode::serialize(entries).map_err(std::io::Error::other)?;
    encoder.write_all(&serialized)?;
    encoder.finish()
}

fn load_entries(path: &Path) -> std::io::Result<Option<Entries>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut serialized = Vec::new();
    GzDecoder::new(file).read_to_end(&mut serialized)?;
    bincode::deserialize(&serialized)
        .map(Some)
        .map_err(std::io::Error::other)
}
