//! Object Module
//!
//! A retrieved storage object: whitelisted response metadata plus an optional
//! body. Objects are built by the storage client from a backend response,
//! rebuilt from a cache record, or synthesized by the resolver as a
//! directory redirect.

use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};

/// Backend custom metadata carrying a redirect location
pub const META_REDIRECT: &str = "x-goog-meta-redirect";
/// Backend custom metadata carrying the redirect status code
pub const META_REDIRECT_CODE: &str = "x-goog-meta-redirect-code";

/// Status used for redirects that don't specify a valid code
pub const DEFAULT_REDIRECT_CODE: u16 = 301;

/// Whitelisted object metadata.
///
/// Only these fields are ever propagated from a backend response. Each field
/// maps to one backend response header (see [`ObjectMeta::HEADERS`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control_allow_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control_expose_headers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control_max_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_code: Option<String>,
}

impl ObjectMeta {
    /// Backend response headers projected into metadata, in field order
    pub const HEADERS: [&'static str; 12] = [
        "content-type",
        "cache-control",
        "content-disposition",
        "content-encoding",
        "content-range",
        "etag",
        "last-modified",
        "access-control-allow-origin",
        "access-control-expose-headers",
        "access-control-max-age",
        META_REDIRECT,
        META_REDIRECT_CODE,
    ];

    fn slot(&mut self, header: &str) -> Option<&mut Option<String>> {
        let slot = match header {
            "content-type" => &mut self.content_type,
            "cache-control" => &mut self.cache_control,
            "content-disposition" => &mut self.content_disposition,
            "content-encoding" => &mut self.content_encoding,
            "content-range" => &mut self.content_range,
            "etag" => &mut self.etag,
            "last-modified" => &mut self.last_modified,
            "access-control-allow-origin" => &mut self.access_control_allow_origin,
            "access-control-expose-headers" => &mut self.access_control_expose_headers,
            "access-control-max-age" => &mut self.access_control_max_age,
            META_REDIRECT | "redirect-target" => &mut self.redirect_target,
            META_REDIRECT_CODE | "redirect-code" => &mut self.redirect_code,
            _ => return None,
        };
        Some(slot)
    }

    /// Project the whitelisted headers of a backend response.
    /// Empty and non-UTF-8 values are skipped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut meta = Self::default();
        for name in Self::HEADERS {
            let value = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty());
            if let (Some(value), Some(slot)) = (value, meta.slot(name)) {
                *slot = Some(value.to_string());
            }
        }
        meta
    }

    /// Set a field by header name. Returns false for names outside the whitelist.
    pub fn set(&mut self, header: &str, value: impl Into<String>) -> bool {
        match self.slot(&header.to_ascii_lowercase()) {
            Some(slot) => {
                *slot = Some(value.into());
                true
            }
            None => false,
        }
    }

    /// Headers to send to a client, excluding the redirect metadata which is
    /// served as a `location` instead.
    pub fn response_headers(&self) -> Vec<(&'static str, &str)> {
        let fields = [
            ("content-type", &self.content_type),
            ("cache-control", &self.cache_control),
            ("content-disposition", &self.content_disposition),
            ("content-encoding", &self.content_encoding),
            ("content-range", &self.content_range),
            ("etag", &self.etag),
            ("last-modified", &self.last_modified),
            ("access-control-allow-origin", &self.access_control_allow_origin),
            (
                "access-control-expose-headers",
                &self.access_control_expose_headers,
            ),
            ("access-control-max-age", &self.access_control_max_age),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
            .collect()
    }
}

/// Object body - either buffered or streaming
#[derive(Debug)]
pub enum ObjectBody {
    /// Fully buffered body (cache hits, small responses, decoded bodies)
    Buffered(Bytes),
    /// Streaming backend response for bodies above the buffering threshold
    Streaming(Incoming),
}

impl ObjectBody {
    /// Convert to buffered bytes, collecting the stream if necessary
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            ObjectBody::Buffered(bytes) => Ok(bytes),
            ObjectBody::Streaming(body) => Ok(body
                .collect()
                .await
                .map_err(|e| ProxyError::HttpError(format!("Failed to collect stream: {}", e)))?
                .to_bytes()),
        }
    }

    /// Get bytes if already buffered, otherwise return None
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ObjectBody::Buffered(bytes) => Some(bytes),
            ObjectBody::Streaming(_) => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ObjectBody::Streaming(_))
    }
}

/// A single storage object
#[derive(Debug)]
pub struct Object {
    pub meta: ObjectMeta,
    /// `None` for stat (HEAD) results
    pub body: Option<ObjectBody>,
    /// Backend status for non-redirect responses: 200, or 206/304 for
    /// range and conditional requests
    pub status: u16,
}

impl Object {
    pub fn new(meta: ObjectMeta, body: ObjectBody) -> Self {
        Self {
            meta,
            body: Some(body),
            status: 200,
        }
    }

    /// Metadata-only object returned by a stat
    pub fn stat(meta: ObjectMeta) -> Self {
        Self {
            meta,
            body: None,
            status: 200,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Synthesized redirect with an empty body and the default code
    pub fn redirect_to(target: impl Into<String>) -> Self {
        let meta = ObjectMeta {
            redirect_target: Some(target.into()),
            ..Default::default()
        };
        Self::new(meta, ObjectBody::Buffered(Bytes::new()))
    }

    /// Redirect location, if this object is a redirect
    pub fn redirect(&self) -> Option<&str> {
        self.meta.redirect_target.as_deref().filter(|t| !t.is_empty())
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect().is_some()
    }

    /// Redirect status; 301 unless the metadata carries a valid 3xx code
    pub fn redirect_code(&self) -> u16 {
        self.meta
            .redirect_code
            .as_deref()
            .and_then(|c| c.trim().parse::<u16>().ok())
            .filter(|c| (300..400).contains(c))
            .unwrap_or(DEFAULT_REDIRECT_CODE)
    }

    /// Buffered body bytes, if any
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref().and_then(|b| b.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_from_headers_keeps_only_whitelist() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        headers.insert("x-goog-generation", HeaderValue::from_static("123"));
        headers.insert("set-cookie", HeaderValue::from_static("a=b"));
        headers.insert("cache-control", HeaderValue::from_static(""));
        headers.insert(META_REDIRECT, HeaderValue::from_static("https://example.com"));

        let meta = ObjectMeta::from_headers(&headers);
        assert_eq!(meta.content_type.as_deref(), Some("text/html"));
        assert_eq!(meta.etag.as_deref(), Some("\"abc\""));
        assert_eq!(meta.cache_control, None);
        assert_eq!(meta.redirect_target.as_deref(), Some("https://example.com"));

        let names: Vec<&str> = meta.response_headers().iter().map(|(k, _)| *k).collect();
        assert_eq!(names, vec!["content-type", "etag"]);
    }

    #[test]
    fn test_redirect_code_defaults() {
        let o = Object::redirect_to("/dir/");
        assert_eq!(o.redirect(), Some("/dir/"));
        assert_eq!(o.redirect_code(), 301);

        let mut meta = ObjectMeta::default();
        assert!(meta.set("redirect-target", "https://example.org"));
        assert!(meta.set("Redirect-Code", "302"));
        assert!(!meta.set("x-unknown", "1"));
        let o = Object::stat(meta.clone());
        assert_eq!(o.redirect_code(), 302);

        meta.redirect_code = Some("bogus".to_string());
        assert_eq!(Object::stat(meta.clone()).redirect_code(), 301);
        meta.redirect_code = Some("200".to_string());
        assert_eq!(Object::stat(meta).redirect_code(), 301);
    }

    #[test]
    fn test_plain_object_is_not_redirect() {
        let o = Object::new(ObjectMeta::default(), ObjectBody::Buffered(Bytes::from("x")));
        assert!(!o.is_redirect());
        assert_eq!(o.body_bytes().map(|b| b.as_ref()), Some(&b"x"[..]));
        assert!(Object::stat(ObjectMeta::default()).body.is_none());
    }
}
