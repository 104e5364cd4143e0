//! Backend Connector
//!
//! Connector for the hyper client talking to the storage backend. Plain TCP
//! for `http://` bases (local emulators, tests), rustls for `https://`.

use crate::{ProxyError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Connection to the backend, with or without TLS
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl BackendStream {
    fn poll_read_tokio(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl Read for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
        match self.poll_read_tokio(cx, &mut tokio_buf) {
            Poll::Ready(Ok(())) => {
                let filled = tokio_buf.filled().len();
                unsafe {
                    buf.advance(filled);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for BackendStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Build a TLS connector trusting the system root certificates
pub fn native_tls_connector() -> Result<TlsConnector> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .map_err(|e| ProxyError::TlsError(format!("Failed to load native certs: {}", e)))?
    {
        root_store
            .add(cert)
            .map_err(|e| ProxyError::TlsError(format!("Failed to add cert: {}", e)))?;
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Connector implementing the `tower::Service<Uri>` contract of hyper's client
#[derive(Clone)]
pub struct BackendConnector {
    tls_connector: Option<TlsConnector>,
}

impl BackendConnector {
    pub fn new(tls_connector: TlsConnector) -> Self {
        Self {
            tls_connector: Some(tls_connector),
        }
    }

    /// Connector that refuses `https://` URIs
    pub fn plain() -> Self {
        Self {
            tls_connector: None,
        }
    }
}

impl Service<Uri> for BackendConnector {
    type Response = BackendStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();

        Box::pin(async move {
            let hostname = uri
                .host()
                .ok_or_else(|| ProxyError::ConfigError("No host in URI".to_string()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let is_tls = match uri.scheme_str() {
                Some("https") => true,
                Some("http") | None => false,
                Some(other) => {
                    return Err(ProxyError::ConfigError(format!(
                        "Unsupported backend scheme: {}",
                        other
                    )))
                }
            };
            let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

            let tcp = TcpStream::connect((hostname.as_str(), port))
                .await
                .map_err(|e| {
                    warn!("TCP connection failed to {}:{}: {}", hostname, port, e);
                    ProxyError::ConnectionError(format!(
                        "Failed to connect to {}:{}: {}",
                        hostname, port, e
                    ))
                })?;

            if let Err(e) = tcp.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}:{}: {}", hostname, port, e);
            }

            if !is_tls {
                debug!("TCP connection established to {}:{}", hostname, port);
                return Ok(BackendStream::Plain(tcp));
            }

            let tls_connector = tls_connector.ok_or_else(|| {
                ProxyError::TlsError(format!("TLS is not configured for {}", hostname))
            })?;
            let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", hostname, e))
            })?;
            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("TLS handshake failed to {}:{}: {}", hostname, port, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", hostname, e))
            })?;

            debug!("TLS connection established to {}:{}", hostname, port);
            Ok(BackendStream::Tls(Box::new(tls)))
        })
    }
}
