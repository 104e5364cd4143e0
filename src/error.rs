//! Error Module
//!
//! Defines error types and result types used throughout the bucket proxy.

use thiserror::Error;

/// Main error type for the bucket proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// The storage backend answered with a status above 399.
    #[error("FetchError {code}: {message}")]
    Fetch { code: u16, message: String },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// Build a fetch error from a backend status and the raw error body
    pub fn fetch(code: u16, message: impl Into<String>) -> Self {
        ProxyError::Fetch {
            code,
            message: message.into(),
        }
    }

    /// Backend status code, if this is a fetch error
    pub fn fetch_code(&self) -> Option<u16> {
        match self {
            ProxyError::Fetch { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the backend signalled that the object does not exist.
    ///
    /// GCS may answer 403 instead of 404 for objects that are absent, so both
    /// qualify for directory index fallback.
    pub fn is_not_found(&self) -> bool {
        matches!(self.fetch_code(), Some(404) | Some(403))
    }

    /// HTTP status a client should see for this error
    pub fn status_code(&self) -> u16 {
        self.fetch_code().unwrap_or(500)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the bucket proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
