//! Token Module
//!
//! OAuth2 bearer tokens for backend requests.

use crate::backend_connector::BackendConnector;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Read-only access to Cloud Storage objects
pub const SCOPE_STORAGE_READ: &str = "https://www.googleapis.com/auth/devstorage.read_only";

/// Default service account token endpoint of the GCE metadata server
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Access token valid for the given scopes
    async fn token(&self, scopes: &[&str]) -> Result<String>;
}

/// Fixed token, for local emulators and tests
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _scopes: &[&str]) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Tokens of the instance's default service account, fetched from the
/// metadata server and cached per scope set until shortly before expiry
pub struct MetadataTokenProvider {
    client: Client<BackendConnector, Full<Bytes>>,
    endpoint: String,
    request_timeout: Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl MetadataTokenProvider {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(BackendConnector::plain());
        Self {
            client,
            endpoint: endpoint.into(),
            request_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_token(&self, scopes: &str) -> Result<CachedToken> {
        let uri = if scopes.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?scopes={}", self.endpoint, scopes)
        };
        let request = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .header("metadata-flavor", "Google")
            .body(Full::new(Bytes::new()))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::TimeoutError(format!("Token request to {} timed out", uri)))?
            .map_err(|e| ProxyError::TokenError(format!("Token request to {} failed: {}", uri, e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::TokenError(format!("Failed to read token response: {}", e)))?
            .to_bytes();
        if !status.is_success() {
            return Err(ProxyError::TokenError(format!(
                "Metadata server answered {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::TokenError(format!("Malformed token response: {}", e)))?;
        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_MARGIN);
        debug!("Fetched access token (expires_in={}s)", parsed.expires_in);

        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn token(&self, scopes: &[&str]) -> Result<String> {
        let key = scopes.join(",");
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&key) {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        let fresh = self.fetch_token(&key).await?;
        let token = fresh.access_token.clone();
        cache.insert(key, fresh);
        info!("Refreshed service account access token");
        Ok(token)
    }
}
