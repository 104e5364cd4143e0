//! Shared fixtures for integration tests: an in-process storage backend
//! that records every request, plus helpers wiring resolver and server to it.
#![allow(dead_code)]

use bucket_proxy::backend_connector::BackendConnector;
use bucket_proxy::cache_key::CacheKeyPolicy;
use bucket_proxy::cache_store::MemoryCacheStore;
use bucket_proxy::config::Config;
use bucket_proxy::http_server::{HttpServer, ServerState};
use bucket_proxy::invalidation::Invalidator;
use bucket_proxy::resolver::{PathResolver, ResolverConfig};
use bucket_proxy::shutdown::ShutdownCoordinator;
use bucket_proxy::storage_client::{StorageClient, StorageClientConfig};
use bucket_proxy::token::StaticTokenProvider;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const TOKEN: &str = "test-token";

/// A stored backend object
#[derive(Debug, Clone)]
pub struct FakeObject {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Serve the body gzip-encoded
    pub gzip: bool,
}

impl FakeObject {
    pub fn new(body: &str) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from(body.to_string()),
            gzip: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn gzip(mut self) -> Self {
        self.gzip = true;
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// A request as seen by the backend
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct BackendState {
    objects: Mutex<HashMap<String, FakeObject>>,
    requests: Mutex<Vec<RecordedRequest>>,
    /// Status returned for unknown paths
    missing_status: Mutex<Option<u16>>,
}

/// In-process object storage backend, serving objects at `/{bucket}/{name}`
pub struct FakeBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BackendState::default());

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&server_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(Self::respond(req, &state)) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    fn respond(req: Request<Incoming>, state: &BackendState) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        state.requests.lock().unwrap().push(RecordedRequest {
            method: req.method().clone(),
            path: path.clone(),
            headers: req.headers().clone(),
        });

        let object = state.objects.lock().unwrap().get(&path).cloned();
        let Some(object) = object else {
            let status = state.missing_status.lock().unwrap().unwrap_or(404);
            return Response::builder()
                .status(status)
                .body(Full::new(Bytes::from_static(b"No such object")))
                .unwrap();
        };

        let mut builder = Response::builder().status(object.status);
        for (name, value) in &object.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut body = object.body.clone();
        let mut status = object.status;
        if let Some((start, end)) = req
            .headers()
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
        {
            let end = end.min(body.len().saturating_sub(1));
            builder = builder.header(
                "content-range",
                format!("bytes {}-{}/{}", start, end, body.len()),
            );
            body = body.slice(start..=end);
            status = 206;
        }
        if object.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).unwrap();
            body = Bytes::from(encoder.finish().unwrap());
            builder = builder.header("content-encoding", "gzip");
        }
        let builder = builder.status(status);

        if req.method() == Method::HEAD {
            return builder.body(Full::new(Bytes::new())).unwrap();
        }
        builder.body(Full::new(body)).unwrap()
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn put(&self, path: &str, body: &str) {
        self.put_object(path, FakeObject::new(body));
    }

    pub fn put_object(&self, path: &str, object: FakeObject) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(path.to_string(), object);
    }

    pub fn remove(&self, path: &str) {
        self.state.objects.lock().unwrap().remove(path);
    }

    /// Status for unknown objects, e.g. 403 for buckets without list access
    pub fn set_missing_status(&self, status: u16) {
        *self.state.missing_status.lock().unwrap() = Some(status);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

/// Backend answering every request with `status`, announcing a body of
/// `declared_len` bytes but closing the connection after `sent`.
/// Returns the base URL.
pub async fn start_truncating_backend(status: u16, declared_len: usize, sent: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // read the request head before answering
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {} Test\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n",
                    status, declared_len
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(sent).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

pub fn storage_client(base: &str) -> StorageClient {
    StorageClient::with_connector(
        StorageClientConfig {
            base: base.to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(StaticTokenProvider::new(TOKEN)),
        BackendConnector::plain(),
    )
}

pub fn resolver(base: &str, store: Arc<MemoryCacheStore>) -> PathResolver {
    PathResolver::new(
        ResolverConfig {
            stat_timeout: Duration::from_secs(2),
            request_deadline: Duration::from_secs(5),
            ..Default::default()
        },
        CacheKeyPolicy::new(base),
        store,
        Arc::new(storage_client(base)),
    )
}

/// Running proxy server bound to an ephemeral port
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryCacheStore>,
    // Holds the broadcast sender open
    _coordinator: ShutdownCoordinator,
}

impl TestServer {
    pub async fn start(backend: &FakeBackend, configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.storage.base = backend.base();
        config
            .buckets
            .insert("default".to_string(), "main".to_string());
        configure(&mut config);

        let store = Arc::new(MemoryCacheStore::new(16 * 1024 * 1024));
        let resolver = resolver(&config.storage.base, Arc::clone(&store));
        let invalidator = Invalidator::new(CacheKeyPolicy::new(config.storage.base.clone()), store.clone());
        let state = ServerState::new(&config, resolver, invalidator);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let signal = coordinator.signal();
        let server = HttpServer::new(addr, state);
        tokio::spawn(async move {
            server.serve(listener, signal).await.unwrap();
        });

        Self {
            addr,
            store,
            _coordinator: coordinator,
        }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

/// Response parts collected for assertions
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Send a request with the given headers and collect the response
pub async fn send(method: Method, url: &str, headers: &[(&str, &str)]) -> TestResponse {
    send_body(method, url, headers, Bytes::new()).await
}

pub async fn send_body(
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> TestResponse {
    let client: Client<BackendConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(BackendConnector::plain());
    let mut builder = Request::builder().method(method).uri(url);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = client
        .request(builder.body(Full::new(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}
