//! Cache Key Module
//!
//! Derives cache keys from backend base, bucket and object name plus the
//! request dimensions that change the cached representation, and decides
//! whether a request may use the cache at all.

use crate::paths;
use hyper::HeaderMap;

/// Suffix for bodies fetched with gzip transfer encoding kept intact
pub const GZIP_SUFFIX: &str = ":gzip";

/// Every variant suffix a key may carry, in the order they are appended.
///
/// Invalidation derives the keys it purges from this list, so a new variant
/// dimension must be added here and nowhere else.
pub const VARIANT_SUFFIXES: &[&str] = &[GZIP_SUFFIX];

/// Whether the `accept-encoding` header allows a gzip response.
///
/// An explicit `gzip` or `x-gzip` entry decides on its own; `*` only counts
/// when gzip is not listed. A q-value of zero is a refusal.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut explicit: Option<bool> = None;
    let mut wildcard: Option<bool> = None;

    let entries = headers
        .get_all("accept-encoding")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','));
    for entry in entries {
        let mut params = entry.split(';');
        let coding = params.next().unwrap_or("").trim().to_ascii_lowercase();
        let refused = params.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        let slot = match coding.as_str() {
            "gzip" | "x-gzip" => &mut explicit,
            "*" => &mut wildcard,
            _ => continue,
        };
        // any acceptable listing wins over a refusal of the same coding
        *slot = Some(slot.unwrap_or(false) || !refused);
    }

    explicit.or(wildcard).unwrap_or(false)
}

/// Variant suffixes selected by a request, in [`VARIANT_SUFFIXES`] order
pub fn request_variants(headers: &HeaderMap) -> Vec<&'static str> {
    VARIANT_SUFFIXES
        .iter()
        .copied()
        .filter(|suffix| match *suffix {
            GZIP_SUFFIX => accepts_gzip(headers),
            _ => false,
        })
        .collect()
}

/// Cache key policy bound to one backend base URL
#[derive(Debug, Clone)]
pub struct CacheKeyPolicy {
    base: String,
}

impl CacheKeyPolicy {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Key without any variant suffix: `{base}/{bucket}/{name}`
    pub fn base_key(&self, bucket: &str, name: &str) -> String {
        format!("{}/{}", self.base, paths::bucket_path(bucket, name))
    }

    /// Key for the representation a request with these headers receives
    pub fn cache_key(&self, bucket: &str, name: &str, headers: &HeaderMap) -> String {
        let mut key = self.base_key(bucket, name);
        for suffix in request_variants(headers) {
            key.push_str(suffix);
        }
        key
    }

    /// Every key an object may be cached under, base key first
    pub fn variant_keys(&self, bucket: &str, name: &str) -> Vec<String> {
        let base = self.base_key(bucket, name);
        let mut keys = vec![base];
        for suffix in VARIANT_SUFFIXES {
            let extended: Vec<String> = keys.iter().map(|k| format!("{}{}", k, suffix)).collect();
            keys.extend(extended);
        }
        keys
    }

    /// Whether a request may be served from, or populate, the cache.
    ///
    /// Range requests, CORS requests and conditional requests always go to
    /// the backend.
    pub fn cacheable(headers: &HeaderMap) -> bool {
        !headers.keys().any(|name| {
            let name = name.as_str();
            name == "range" || name == "origin" || name.starts_with("if-")
        })
    }
}
