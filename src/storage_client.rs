//! Storage Client Module
//!
//! Authenticated GET/HEAD requests against the object storage backend
//! (Cloud Storage XML API). Backend statuses above 399 become
//! [`ProxyError::Fetch`]; only whitelisted response headers survive into the
//! returned [`Object`].

use crate::backend_connector::{native_tls_connector, BackendConnector};
use crate::cache_key::accepts_gzip;
use crate::object::{Object, ObjectBody, ObjectMeta};
use crate::paths;
use crate::token::{TokenProvider, SCOPE_STORAGE_READ};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{HeaderMap, Method, Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bodies with a known length above this are streamed instead of buffered
pub const STREAMING_THRESHOLD: u64 = 1024 * 1024;

/// Client request headers forwarded to the backend verbatim
pub const FORWARDED_HEADERS: [&str; 4] = ["if-modified-since", "if-none-match", "range", "user-agent"];

/// Characters escaped inside a single path segment of a backend URL
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Retrieves objects from the backend
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// GET or HEAD an object, forwarding the whitelisted request headers.
    /// A HEAD yields a metadata-only object.
    async fn fetch(
        &self,
        method: Method,
        bucket: &str,
        name: &str,
        headers: &HeaderMap,
    ) -> Result<Object>;

    /// Metadata-only lookup
    async fn stat(&self, bucket: &str, name: &str) -> Result<Object> {
        self.fetch(Method::HEAD, bucket, name, &HeaderMap::new()).await
    }
}

#[derive(Debug, Clone)]
pub struct StorageClientConfig {
    /// Backend base URL, e.g. `https://storage.googleapis.com`
    pub base: String,
    pub request_timeout: Duration,
    pub streaming_threshold: u64,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        Self {
            base: "https://storage.googleapis.com".to_string(),
            request_timeout: Duration::from_secs(30),
            streaming_threshold: STREAMING_THRESHOLD,
        }
    }
}

/// Backend client over hyper's pooled legacy client
pub struct StorageClient {
    client: Client<BackendConnector, Full<Bytes>>,
    config: StorageClientConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl StorageClient {
    /// Client able to reach `http://` and `https://` bases
    pub fn new(config: StorageClientConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let connector = if config.base.starts_with("https://") {
            BackendConnector::new(native_tls_connector()?)
        } else {
            BackendConnector::plain()
        };
        Ok(Self::with_connector(config, tokens, connector))
    }

    pub fn with_connector(
        config: StorageClientConfig,
        tokens: Arc<dyn TokenProvider>,
        connector: BackendConnector,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        debug!(
            "Created storage client (base={}, timeout={:?})",
            config.base, config.request_timeout
        );
        Self {
            client,
            config,
            tokens,
        }
    }

    pub fn base(&self) -> &str {
        &self.config.base
    }

    /// `{base}/{bucket}/{name}` with every path segment percent-encoded
    pub fn object_url(&self, bucket: &str, name: &str) -> String {
        let path = paths::bucket_path(bucket, name);
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect();
        format!("{}/{}", self.config.base.trim_end_matches('/'), encoded.join("/"))
    }

    async fn send(&self, request: Request<Full<Bytes>>, url: &str) -> Result<Response<Incoming>> {
        tokio::time::timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!(
                    "Request to {} timed out after {:?}",
                    url, self.config.request_timeout
                ))
            })?
            .map_err(|e| {
                if e.is_connect() {
                    ProxyError::ConnectionError(format!("Failed to connect for {}: {}", url, e))
                } else {
                    ProxyError::HttpError(format!("Request to {} failed: {}", url, e))
                }
            })
    }

    /// Read and discard the body of a failed response. The status always
    /// wins over a body read error.
    async fn fetch_error(response: Response<Incoming>) -> ProxyError {
        let status = response.status();
        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Failed to read error body for status {}: {}", status, e);
                Bytes::new()
            }
        };
        ProxyError::fetch(
            status.as_u16(),
            format!("{}: {}", status, String::from_utf8_lossy(&body)),
        )
    }
}

fn gunzip(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| ProxyError::HttpError(format!("Failed to decode gzip body: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl ObjectFetcher for StorageClient {
    async fn fetch(
        &self,
        method: Method,
        bucket: &str,
        name: &str,
        headers: &HeaderMap,
    ) -> Result<Object> {
        let url = self.object_url(bucket, name);
        let token = self.tokens.token(&[SCOPE_STORAGE_READ]).await?;

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&url)
            .header("accept-encoding", "gzip")
            .header("authorization", format!("Bearer {}", token));
        for header in FORWARDED_HEADERS {
            for value in headers.get_all(header) {
                builder = builder.header(header, value);
            }
        }
        let request = builder.body(Full::new(Bytes::new()))?;

        debug!("{} {}", method, url);
        let response = self.send(request, &url).await?;
        let status = response.status();

        if method == Method::HEAD {
            if !status.is_success() {
                return Err(Self::fetch_error(response).await);
            }
            let mut meta = ObjectMeta::from_headers(response.headers());
            // no body was read, so body-derived headers don't apply
            meta.content_encoding = None;
            meta.content_range = None;
            return Ok(Object::stat(meta));
        }

        if status.as_u16() > 399 {
            return Err(Self::fetch_error(response).await);
        }

        let mut meta = ObjectMeta::from_headers(response.headers());
        let gzipped = meta
            .content_encoding
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("gzip"));
        let length = content_length(response.headers());
        let body = response.into_body();

        let body = if gzipped && !accepts_gzip(headers) {
            let compressed = ObjectBody::Streaming(body).into_bytes().await?;
            meta.content_encoding = None;
            ObjectBody::Buffered(gunzip(&compressed)?)
        } else if length.is_some_and(|len| len <= self.config.streaming_threshold) {
            ObjectBody::Streaming(body).into_bytes().await.map(ObjectBody::Buffered)?
        } else {
            if length.is_none() {
                warn!("{} has no content-length, streaming uncached", url);
            }
            ObjectBody::Streaming(body)
        };

        Ok(Object::new(meta, body).with_status(status.as_u16()))
    }
}
