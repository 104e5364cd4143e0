//! Invalidation Module
//!
//! Removes cached objects when the backend reports a change. Every variant
//! key of an object is purged so no representation outlives the change.

use crate::cache_key::CacheKeyPolicy;
use crate::cache_store::CacheStore;
use crate::Result;
use hyper::{HeaderMap, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Header carrying the notification kind
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";

/// Object Change Notification payload. Only the object identity matters.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotification {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone)]
pub struct Invalidator {
    policy: CacheKeyPolicy,
    store: Arc<dyn CacheStore>,
}

impl Invalidator {
    pub fn new(policy: CacheKeyPolicy, store: Arc<dyn CacheStore>) -> Self {
        Self { policy, store }
    }

    /// Delete every cached variant of `bucket/name`. Objects that were
    /// never cached purge successfully.
    pub async fn purge(&self, bucket: &str, name: &str) -> Result<()> {
        let keys = self.policy.variant_keys(bucket, name);
        debug!("Purging {} cache keys for {}/{}", keys.len(), bucket, name);
        self.store.delete_all(&keys).await
    }

    /// Handle a change notification webhook call and return the status to
    /// answer with. A 500 makes the notifier retry.
    pub async fn handle_change_notification(&self, headers: &HeaderMap, body: &[u8]) -> StatusCode {
        let state = headers
            .get(RESOURCE_STATE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if state == "sync" {
            debug!("Ignoring sync notification");
            return StatusCode::OK;
        }

        let notification: ChangeNotification = match serde_json::from_slice(body) {
            Ok(n) => n,
            Err(e) => {
                error!("Malformed change notification: {}", e);
                return StatusCode::BAD_REQUEST;
            }
        };

        match self.purge(&notification.bucket, &notification.name).await {
            Ok(()) => {
                info!(
                    "Purged cache for {}/{} ({})",
                    notification.bucket, notification.name, state
                );
                StatusCode::OK
            }
            Err(e) => {
                error!(
                    "Purge failed for {}/{}: {}",
                    notification.bucket, notification.name, e
                );
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
