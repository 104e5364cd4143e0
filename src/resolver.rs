//! Path Resolver Module
//!
//! Treats object names like file paths. A name that looks like a directory
//! (no extension) is fetched as-is while `name/index` is stat'ed in a
//! separate task; when the object itself is missing but the index exists,
//! the result is a redirect to `/name/`.

use crate::cache_key::CacheKeyPolicy;
use crate::cache_store::{CacheRecord, CacheStore};
use crate::object::Object;
use crate::paths;
use crate::storage_client::{ObjectFetcher, STREAMING_THRESHOLD};
use crate::{ProxyError, Result};
use hyper::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Resolution settings, fixed at startup
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Appended to directory-like names, e.g. `index.html`
    pub index: String,
    /// Largest body written to the cache
    pub cache_ceiling: u64,
    pub cache_ttl: Duration,
    /// How long a failed open waits for the index stat
    pub stat_timeout: Duration,
    /// Overall budget of one resolution
    pub request_deadline: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            index: "index.html".to_string(),
            cache_ceiling: STREAMING_THRESHOLD,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            stat_timeout: Duration::from_secs(5),
            request_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct PathResolver {
    config: Arc<ResolverConfig>,
    policy: CacheKeyPolicy,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn ObjectFetcher>,
}

impl PathResolver {
    pub fn new(
        config: ResolverConfig,
        policy: CacheKeyPolicy,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn ObjectFetcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            policy,
            store,
            fetcher,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn policy(&self) -> &CacheKeyPolicy {
        &self.policy
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.store)
    }

    /// Resolve `path` within `bucket`, bounded by the request deadline
    pub async fn resolve_with_deadline(
        &self,
        bucket: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Object> {
        tokio::time::timeout(
            self.config.request_deadline,
            self.open_file(bucket, path, headers),
        )
        .await
        .map_err(|_| {
            ProxyError::TimeoutError(format!(
                "Resolving {}/{} exceeded {:?}",
                bucket, path, self.config.request_deadline
            ))
        })?
    }

    /// Open `path` as a file path: append the index to directory paths and
    /// fall back to a directory redirect when only `path/index` exists.
    pub async fn open_file(&self, bucket: &str, path: &str, headers: &HeaderMap) -> Result<Object> {
        let index = self.config.index.as_str();
        let mut name = path.to_string();
        if name.is_empty() || name.ends_with('/') {
            name.push_str(index);
        }

        let check_stat = !name.ends_with(index) && !paths::has_extension(&name);
        let stat_task = check_stat.then(|| {
            let resolver = self.clone();
            let bucket = bucket.to_string();
            let index_name = paths::join(&[&name, index]);
            let headers = headers.clone();
            tokio::spawn(async move { resolver.stat(&bucket, &index_name, &headers).await })
        });

        let open_error = match self.open(bucket, &name, headers).await {
            Ok(object) => return Ok(object),
            Err(e) => e,
        };
        // Without a stat, or on errors other than not-found, the stat task
        // (if any) is left to finish on its own.
        let Some(stat_task) = stat_task else {
            return Err(open_error);
        };
        if !open_error.is_not_found() {
            return Err(open_error);
        }

        match tokio::time::timeout(self.config.stat_timeout, stat_task).await {
            Err(_) => {
                error!("Index stat timed out (bucket={}, name={})", bucket, name);
                Err(open_error)
            }
            Ok(Err(join_error)) => {
                warn!("Index stat task failed for {}/{}: {}", bucket, name, join_error);
                Err(open_error)
            }
            Ok(Ok(Err(stat_error))) => {
                debug!("No index for {}/{}: {}", bucket, name, stat_error);
                Err(open_error)
            }
            Ok(Ok(Ok(stat))) if stat.is_redirect() => Ok(stat),
            Ok(Ok(Ok(_))) => Ok(Object::redirect_to(paths::directory_url(&name))),
        }
    }

    /// Fetch an object from the cache or the backend. Cacheable backend
    /// responses small enough to buffer are written back to the cache.
    pub async fn open(&self, bucket: &str, name: &str, headers: &HeaderMap) -> Result<Object> {
        let cacheable = CacheKeyPolicy::cacheable(headers);
        let key = self.policy.cache_key(bucket, name, headers);

        if cacheable {
            if let Some(object) = self.store.get(&key).await {
                debug!("Cache hit: {}", key);
                return Ok(object);
            }
            debug!("Cache miss: {}", key);
        }

        let object = self.fetcher.fetch(Method::GET, bucket, name, headers).await?;
        if cacheable && object.status == 200 {
            self.write_back(&key, &object).await;
        }
        Ok(object)
    }

    /// Metadata lookup, cache first. Stat results are never cached.
    pub async fn stat(&self, bucket: &str, name: &str, headers: &HeaderMap) -> Result<Object> {
        if CacheKeyPolicy::cacheable(headers) {
            let key = self.policy.cache_key(bucket, name, headers);
            if let Some(object) = self.store.get(&key).await {
                return Ok(object);
            }
        }
        self.fetcher.stat(bucket, name).await
    }

    async fn write_back(&self, key: &str, object: &Object) {
        let Some(body) = object.body_bytes() else {
            debug!("Not caching streamed body: {}", key);
            return;
        };
        if body.len() as u64 > self.config.cache_ceiling {
            debug!("Not caching {} ({} bytes exceeds ceiling)", key, body.len());
            return;
        }

        let result = match CacheRecord::from_object(object, self.config.cache_ttl) {
            Ok(record) => self.store.put(key, record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to cache {}: {}", key, e);
        }
    }
}
