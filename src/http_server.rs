//! HTTP Server Module
//!
//! Front controller: maps requests onto buckets by host, applies host
//! redirects and TLS-only policy, routes change notifications to the
//! invalidator and serves everything else through the path resolver.

use crate::config::Config;
use crate::invalidation::Invalidator;
use crate::resolver::PathResolver;
use crate::serve::{empty_body, serve_object, status_response, valid_method, CorsConfig, ResponseBody};
use crate::shutdown::ShutdownSignal;
use crate::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// `strict-transport-security` value for TLS-only hosts
pub const STS_VALUE: &str = "max-age=10886400; includeSubDomains; preload";

/// Request routing state shared by all connections
pub struct ServerState {
    resolver: PathResolver,
    invalidator: Invalidator,
    buckets: HashMap<String, String>,
    /// (pattern, target), longest pattern first
    redirects: Vec<(String, String)>,
    tls_only: HashSet<String>,
    hook_path: String,
    cors: CorsConfig,
}

impl ServerState {
    pub fn new(config: &Config, resolver: PathResolver, invalidator: Invalidator) -> Self {
        let mut redirects: Vec<(String, String)> = config
            .redirects
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        redirects.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            resolver,
            invalidator,
            buckets: config.buckets.clone(),
            redirects,
            tls_only: config.server.tls_only.iter().cloned().collect(),
            hook_path: config.server.hook_path.clone(),
            cors: config.cors.clone(),
        }
    }

    /// Bucket mapped to `host`, or the default bucket
    pub fn bucket_for_host(&self, host: &str) -> &str {
        self.buckets
            .get(host)
            .or_else(|| self.buckets.get("default"))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Redirect target for a request, if a redirect pattern matches.
    ///
    /// A bare host pattern matches every path of that host. A pattern with a
    /// path matches that exact path, or every path below it when it ends
    /// with `/`.
    pub fn redirect_for(&self, host: &str, path: &str) -> Option<&str> {
        let request = format!("{}{}", host, path);
        self.redirects
            .iter()
            .find(|(pattern, _)| match pattern.find('/') {
                None => pattern == host,
                Some(_) if pattern.ends_with('/') => request.starts_with(pattern.as_str()),
                Some(_) => *pattern == request,
            })
            .map(|(_, target)| target.as_str())
    }
}

/// Host name of a request without the port
fn request_host(req: &Request<Incoming>) -> String {
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("");
    strip_port(host).to_string()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.split_once(']').map(|(h, _)| &host[..h.len() + 1]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

fn redirect_response(location: &str) -> Response<ResponseBody> {
    let mut response = status_response(StatusCode::MOVED_PERMANENTLY);
    match HeaderValue::from_str(location) {
        Ok(v) => {
            response.headers_mut().insert("location", v);
        }
        Err(_) => warn!("Invalid redirect location: {:?}", location),
    }
    response
}

fn path_and_query(req: &Request<Incoming>) -> String {
    match req.uri().query() {
        Some(q) if !q.is_empty() => format!("{}?{}", req.uri().path(), q),
        _ => req.uri().path().to_string(),
    }
}

/// HTTP server in front of the path resolver
pub struct HttpServer {
    listen_addr: SocketAddr,
    state: Arc<ServerState>,
    active_connections: Arc<AtomicUsize>,
}

impl HttpServer {
    pub fn new(listen_addr: SocketAddr, state: ServerState) -> Self {
        Self {
            listen_addr,
            state: Arc::new(state),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of open client connections
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_connections)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let state = Arc::clone(&self.state);
                            let active_connections = Arc::clone(&self.active_connections);
                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, state, active_connections).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP server received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        info!("HTTP server stopped");
        Ok(())
    }

    /// Serve a single HTTP connection
    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            async move { Self::handle_request(req, state).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_canceled() || err.is_incomplete_message() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Handle a single HTTP request
    pub async fn handle_request(
        req: Request<Incoming>,
        state: Arc<ServerState>,
    ) -> std::result::Result<Response<ResponseBody>, Infallible> {
        let host = request_host(&req);
        let method = req.method().clone();
        debug!("Processing {} {} for host {}", method, req.uri(), host);

        if let Some(target) = state.redirect_for(&host, req.uri().path()) {
            let location = format!("{}{}", target, path_and_query(&req));
            return Ok(redirect_response(&location));
        }

        if req.uri().path() == state.hook_path {
            return Ok(Self::handle_hook(req, &state).await);
        }

        let forwarded_proto = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let force_tls = state.tls_only.contains(&host);

        let mut response = Self::handle_object_request(req, &state, &host, force_tls, &forwarded_proto).await;
        if force_tls && forwarded_proto == "https" {
            response
                .headers_mut()
                .insert("strict-transport-security", HeaderValue::from_static(STS_VALUE));
        }
        Ok(response)
    }

    async fn handle_object_request(
        req: Request<Incoming>,
        state: &ServerState,
        host: &str,
        force_tls: bool,
        forwarded_proto: &str,
    ) -> Response<ResponseBody> {
        let method = req.method().clone();
        if !valid_method(&method) {
            warn!("Unsupported method: {}", method);
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        if force_tls && forwarded_proto == "http" {
            let authority = req
                .headers()
                .get("host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or(host);
            let location = format!("https://{}{}", authority, path_and_query(&req));
            return redirect_response(&location);
        }

        let name = match percent_decode_str(req.uri().path()).decode_utf8() {
            Ok(path) => path.trim_start_matches('/').to_string(),
            Err(e) => {
                debug!("Undecodable path {:?}: {}", req.uri().path(), e);
                return status_response(StatusCode::BAD_REQUEST);
            }
        };
        let bucket = state.bucket_for_host(host);

        match state
            .resolver
            .resolve_with_deadline(bucket, &name, req.headers())
            .await
        {
            Ok(object) => serve_object(&method, req.headers(), object, &state.cors),
            Err(e) => {
                let code = e.status_code();
                if code != 404 {
                    error!("{}/{}: {}", bucket, name, e);
                }
                status_response(
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                )
            }
        }
    }

    async fn handle_hook(req: Request<Incoming>, state: &ServerState) -> Response<ResponseBody> {
        if req.method() != Method::POST {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read change notification body: {}", e);
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        let status = state
            .invalidator
            .handle_change_notification(&parts.headers, &body)
            .await;
        if status.is_success() {
            let mut response = Response::new(empty_body());
            *response.status_mut() = status;
            response
        } else {
            status_response(status)
        }
    }
}
