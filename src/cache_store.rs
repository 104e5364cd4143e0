//! Cache Store Module
//!
//! Key/value storage for fetched objects with a fixed TTL. A store never
//! fails a request: misses, expired entries and undecodable records all read
//! as "not found", and callers only log write failures.
//!
//! Records are serialized as a length-prefixed JSON header (metadata and
//! timestamps) followed by the raw body bytes.

use crate::object::{Object, ObjectBody, ObjectMeta};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Serialized header of a cache record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    meta: ObjectMeta,
    created_at: SystemTime,
    expires_at: SystemTime,
}

/// An object as held by a cache store
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub meta: ObjectMeta,
    pub body: Bytes,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl CacheRecord {
    pub fn new(meta: ObjectMeta, body: Bytes, ttl: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            meta,
            body,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Build a record from an object with a buffered body
    pub fn from_object(object: &Object, ttl: Duration) -> Result<Self> {
        let body = object.body_bytes().ok_or_else(|| {
            ProxyError::CacheError("only buffered bodies can be cached".to_string())
        })?;
        Ok(Self::new(object.meta.clone(), body.clone(), ttl))
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    pub fn into_object(self) -> Object {
        Object::new(self.meta, ObjectBody::Buffered(self.body))
    }

    /// Encode as `[u32 header length][JSON header][body]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&RecordHeader {
            meta: self.meta.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        })?;
        let header_len = u32::try_from(header.len()).map_err(|_| {
            ProxyError::SerializationError("cache record header too large".to_string())
        })?;

        let mut out = Vec::with_capacity(4 + header.len() + self.body.len());
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(ProxyError::SerializationError(
                "cache record truncated".to_string(),
            ));
        }
        let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let rest = &data[4..];
        if rest.len() < header_len {
            return Err(ProxyError::SerializationError(format!(
                "cache record header truncated: want {} bytes, have {}",
                header_len,
                rest.len()
            )));
        }
        let header: RecordHeader = serde_json::from_slice(&rest[..header_len])?;
        Ok(Self {
            meta: header.meta,
            body: Bytes::copy_from_slice(&rest[header_len..]),
            created_at: header.created_at,
            expires_at: header.expires_at,
        })
    }
}

/// Shared cache storage.
///
/// `get` reports "not found" for anything it can't serve. `put` and the
/// deletes return errors so the caller decides whether they matter: the
/// resolver only logs them, invalidation surfaces them. Deleting an absent
/// key is success.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Object>;

    async fn put(&self, key: &str, record: CacheRecord) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key, attempting all of them and reporting the first error
    async fn delete_all(&self, keys: &[String]) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.delete(key).await {
                warn!("Cache delete failed for key {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Counters for a cache store
#[derive(Debug, Default)]
pub struct CacheStoreMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub expirations: AtomicU64,
    pub evictions: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl CacheStoreMetrics {
    pub fn snapshot(&self) -> CacheStoreMetricsSnapshot {
        CacheStoreMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStoreMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub decode_failures: u64,
}

impl CacheStoreMetricsSnapshot {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Default)]
struct MemoryEntries {
    records: HashMap<String, Vec<u8>>,
    /// front = least recently used
    lru_order: VecDeque<String>,
    current_size: u64,
}

impl MemoryEntries {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru_order.iter().position(|k| k == key) {
            if let Some(k) = self.lru_order.remove(pos) {
                self.lru_order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.records.remove(key) {
            Some(data) => {
                self.current_size = self.current_size.saturating_sub(data.len() as u64);
                self.lru_order.retain(|k| k != key);
                true
            }
            None => false,
        }
    }
}

/// In-process cache store bounded by total encoded size, with LRU eviction
pub struct MemoryCacheStore {
    entries: Mutex<MemoryEntries>,
    max_size: u64,
    metrics: CacheStoreMetrics,
}

impl MemoryCacheStore {
    pub fn new(max_size: u64) -> Self {
        debug!("Creating memory cache store (max_size={} bytes)", max_size);
        Self {
            entries: Mutex::new(MemoryEntries::default()),
            max_size,
            metrics: CacheStoreMetrics::default(),
        }
    }

    pub fn metrics(&self) -> CacheStoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.records.contains_key(key))
            .unwrap_or(false)
    }

    /// Current encoded size in bytes
    pub fn size(&self) -> u64 {
        self.entries.lock().map(|e| e.current_size).unwrap_or(0)
    }

    /// Store raw encoded bytes under a key, bypassing record encoding
    pub fn put_raw(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len() as u64;
        if size > self.max_size {
            warn!(
                "Entry {} too large for memory cache ({} bytes > {} bytes max)",
                key, size, self.max_size
            );
            return Ok(());
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|e| ProxyError::CacheError(format!("memory cache lock poisoned: {}", e)))?;
        entries.remove(key);

        while entries.current_size + size > self.max_size {
            let Some(victim) = entries.lru_order.front().cloned() else {
                break;
            };
            entries.remove(&victim);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted {} from memory cache", victim);
        }

        entries.records.insert(key.to_string(), data);
        entries.lru_order.push_back(key.to_string());
        entries.current_size += size;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<Object> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Memory cache lock poisoned on get({}): {}", key, e);
                return None;
            }
        };

        let Some(data) = entries.records.get(key) else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match CacheRecord::decode(data) {
            Ok(record) if record.is_expired() => {
                entries.remove(key);
                self.metrics.expirations.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Memory cache entry expired: {}", key);
                None
            }
            Ok(record) => {
                entries.touch(key);
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.into_object())
            }
            Err(e) => {
                warn!("Dropping undecodable memory cache entry {}: {}", key, e);
                entries.remove(key);
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn put(&self, key: &str, record: CacheRecord) -> Result<()> {
        let data = record.encode()?;
        self.put_raw(key, data)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| ProxyError::CacheError(format!("memory cache lock poisoned: {}", e)))?;
        if entries.remove(key) {
            debug!("Removed memory cache entry: {}", key);
        }
        Ok(())
    }
}
