//! Disk Cache Store Module
//!
//! File-based cache store for a directory that may be shared by several proxy
//! instances. Each entry is one file holding an encoded [`CacheRecord`]; the
//! expiry travels inside the record. Writes go to a uniquely named temp file
//! that is renamed into place, so readers never observe a partial record.
//!
//! The store is bounded by `max_size` bytes. A write that pushes the tracked
//! size over the bound runs a cleanup pass: expired, corrupt and stale temp
//! files are removed, then the oldest entries by modification time until the
//! directory fits again. The same pass is meant to run periodically, since
//! keys that are never read again would otherwise never expire.

use crate::cache_store::{CacheRecord, CacheStore};
use crate::object::Object;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Filesystem-unsafe ASCII characters
const FILENAME_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|')
    .add(b'%');

/// Longest sanitized key used verbatim; longer keys are hashed
const MAX_SANITIZED_LEN: usize = 200;

const ENTRY_SUFFIX: &str = ".cache";

const TEMP_SUFFIX: &str = ".tmp";

/// Temp files older than this are leftovers of interrupted writes
const STALE_TEMP_AGE: Duration = Duration::from_secs(300);

/// Turn a cache key into a file name.
///
/// Keys are percent-encoded so distinct keys never collide. Keys longer than
/// 200 characters after encoding are replaced by their BLAKE3 hash.
pub fn sanitize_cache_key(cache_key: &str) -> String {
    let sanitized = utf8_percent_encode(cache_key, FILENAME_UNSAFE).to_string();
    if sanitized.len() > MAX_SANITIZED_LEN {
        let hash = blake3::hash(cache_key.as_bytes());
        debug!(
            "Cache key hashed (exceeds {} chars): original_length={}, hashed={}",
            MAX_SANITIZED_LEN,
            cache_key.len(),
            hash.to_hex()
        );
        hash.to_hex().to_string()
    } else {
        sanitized
    }
}

/// Statistics of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheCleanupStats {
    pub expired_removed: usize,
    pub corrupt_removed: usize,
    pub evicted: usize,
    pub temp_files_removed: usize,
    /// Bytes of entries left after the pass
    pub bytes_remaining: u64,
}

pub struct DiskCacheStore {
    cache_dir: PathBuf,
    max_size: u64,
    /// Bytes of entry files, as written by this instance. Reset to the
    /// scanned total by every cleanup pass.
    current_size: AtomicU64,
    cleanup_lock: Mutex<()>,
}

impl DiskCacheStore {
    /// Create a store rooted at `cache_dir`, creating the directory if needed
    pub fn new(cache_dir: PathBuf, max_size: u64) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to create cache directory {:?}: {}",
                cache_dir, e
            ))
        })?;
        let current_size = scan_entry_bytes(&cache_dir);
        info!(
            "Disk cache store initialized at {:?} ({} of {} bytes used)",
            cache_dir, current_size, max_size
        );
        Ok(Self {
            cache_dir,
            max_size,
            current_size: AtomicU64::new(current_size),
            cleanup_lock: Mutex::new(()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Tracked size of all entries in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn entry_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}{}", sanitize_cache_key(cache_key), ENTRY_SUFFIX))
    }

    fn add_size(&self, bytes: u64) {
        self.current_size.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_size(&self, bytes: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| {
                Some(size.saturating_sub(bytes))
            });
    }

    async fn remove_entry(&self, path: &Path) -> Result<()> {
        let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                self.sub_size(len);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProxyError::CacheError(format!(
                "Failed to remove cache file {:?}: {}",
                path, e
            ))),
        }
    }

    /// Remove expired, corrupt and stale temp files, then evict the oldest
    /// entries until the directory fits within `max_size`
    pub async fn perform_cache_cleanup(&self) -> Result<CacheCleanupStats> {
        let _guard = self.cleanup_lock.lock().await;
        let operation_start = std::time::Instant::now();
        let mut stats = CacheCleanupStats::default();

        let mut dir = tokio::fs::read_dir(&self.cache_dir).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to read cache directory {:?}: {}",
                self.cache_dir, e
            ))
        })?;

        let mut live: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Cache directory scan interrupted: {}", e);
                    break;
                }
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            if name.ends_with(TEMP_SUFFIX) {
                let stale = modified.elapsed().is_ok_and(|age| age > STALE_TEMP_AGE);
                if stale && remove_quietly(&path).await {
                    stats.temp_files_removed += 1;
                }
                continue;
            }
            if !name.ends_with(ENTRY_SUFFIX) {
                continue;
            }

            let Ok(data) = tokio::fs::read(&path).await else {
                // removed concurrently
                continue;
            };
            match CacheRecord::decode(&data) {
                Err(e) => {
                    debug!("Removing undecodable cache file {:?}: {}", path, e);
                    if remove_quietly(&path).await {
                        stats.corrupt_removed += 1;
                    }
                }
                Ok(record) if record.is_expired() => {
                    if remove_quietly(&path).await {
                        stats.expired_removed += 1;
                    }
                }
                Ok(_) => live.push((path, metadata.len(), modified)),
            }
        }

        let mut total: u64 = live.iter().map(|(_, len, _)| len).sum();
        if total > self.max_size {
            live.sort_by_key(|(_, _, modified)| *modified);
            for (path, len, _) in &live {
                if total <= self.max_size {
                    break;
                }
                if remove_quietly(path).await {
                    total = total.saturating_sub(*len);
                    stats.evicted += 1;
                    debug!("Evicted {:?} from disk cache", path);
                }
            }
        }

        self.current_size.store(total, Ordering::Relaxed);
        stats.bytes_remaining = total;
        info!(
            "Disk cache cleanup completed: expired_removed={}, corrupt_removed={}, evicted={}, temp_files_removed={}, bytes_remaining={}, duration={:.2}ms",
            stats.expired_removed,
            stats.corrupt_removed,
            stats.evicted,
            stats.temp_files_removed,
            stats.bytes_remaining,
            operation_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(stats)
    }
}

/// Remove a file, logging failures other than absence
async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove cache file {:?}: {}", path, e);
            false
        }
    }
}

/// Total size of the entry files directly under `dir`
fn scan_entry_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(ENTRY_SUFFIX))
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn get(&self, key: &str) -> Option<Object> {
        let path = self.entry_path(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cache file {:?}: {}", path, e);
                return None;
            }
        };

        let record = match CacheRecord::decode(&data) {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping undecodable cache file {:?}: {}", path, e);
                if let Err(e) = self.remove_entry(&path).await {
                    warn!("{}", e);
                }
                return None;
            }
        };

        if record.is_expired() {
            debug!("Disk cache entry expired: {}", key);
            if let Err(e) = self.remove_entry(&path).await {
                warn!("{}", e);
            }
            return None;
        }

        Some(record.into_object())
    }

    async fn put(&self, key: &str, record: CacheRecord) -> Result<()> {
        let data = record.encode()?;
        let size = data.len() as u64;
        if size > self.max_size {
            warn!(
                "Entry {} too large for disk cache ({} bytes > {} bytes max)",
                key, size, self.max_size
            );
            return Ok(());
        }

        let path = self.entry_path(key);
        let temp_path = path.with_extension(format!("{}{}", uuid::Uuid::new_v4(), TEMP_SUFFIX));
        let replaced = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

        if let Err(e) = tokio::fs::write(&temp_path, &data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ProxyError::CacheError(format!(
                "Failed to write cache file {:?}: {}",
                temp_path, e
            )));
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ProxyError::CacheError(format!(
                "Failed to rename cache file {:?}: {}",
                path, e
            )));
        }

        self.add_size(size);
        self.sub_size(replaced);
        debug!("Stored {} bytes for {} at {:?}", size, key, path);

        if self.size() > self.max_size {
            if let Err(e) = self.perform_cache_cleanup().await {
                warn!("Disk cache cleanup after write failed: {}", e);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove_entry(&self.entry_path(key)).await
    }
}
