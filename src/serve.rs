//! Serve Module
//!
//! Turns a resolved [`Object`] into the HTTP response for a client request:
//! object metadata headers, CORS, redirects and, for GET only, the body.

use crate::object::{Object, ObjectBody};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Supported methods, as sent in `allow` and CORS allow-methods
pub const ALLOW_METHODS: &str = "GET, HEAD, OPTIONS";

/// Headers exposed to cross-origin scripts on preflight
pub const CORS_EXPOSE_HEADERS: &str = "Location, Etag, Content-Disposition";

/// Cross-origin settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; a leading `*` allows any origin
    #[serde(default)]
    pub origin: Vec<String>,
    /// Preflight cache lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
}

impl CorsConfig {
    /// Value for `access-control-allow-origin`, if `origin` is allowed
    pub fn allowed_origin(&self, origin: &str) -> Option<String> {
        match self.origin.first() {
            None => None,
            Some(first) if first == "*" => Some("*".to_string()),
            Some(_) => self
                .origin
                .iter()
                .any(|o| o == origin)
                .then(|| origin.to_string()),
        }
    }
}

pub fn valid_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

fn object_body_to_box_body(body: ObjectBody) -> ResponseBody {
    match body {
        ObjectBody::Buffered(bytes) => full_body(bytes),
        ObjectBody::Streaming(incoming) => incoming
            .map_err(|e| {
                error!("Stream error: {}", e);
                e
            })
            .boxed(),
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(_) => warn!("Skipping invalid {} header value: {:?}", name, value),
    }
}

/// Plain-text response whose body is the status text, e.g. `Not Found`
pub fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let text = status.canonical_reason().unwrap_or("").to_string();
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Build the response for `object`.
///
/// Redirects are answered with `location` and the object's redirect code,
/// except on OPTIONS. The body is written for GET only.
pub fn serve_object(
    method: &Method,
    request_headers: &HeaderMap,
    object: Object,
    cors: &CorsConfig,
) -> Response<ResponseBody> {
    let mut headers = HeaderMap::new();
    for (name, value) in object.meta.response_headers() {
        set_header(&mut headers, name, value);
    }
    headers.insert("allow", HeaderValue::from_static(ALLOW_METHODS));
    // bodies differ by gzip acceptance
    headers.insert("vary", HeaderValue::from_static("accept-encoding"));

    let origin = request_headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Some(allowed) = cors.allowed_origin(origin) {
        set_header(&mut headers, "access-control-allow-origin", &allowed);
        if *method == Method::OPTIONS {
            headers.insert(
                "access-control-allow-methods",
                HeaderValue::from_static(ALLOW_METHODS),
            );
            let requested = request_headers
                .get("access-control-request-headers")
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static(""));
            headers.insert("access-control-allow-headers", requested);
            headers.insert(
                "access-control-expose-headers",
                HeaderValue::from_static(CORS_EXPOSE_HEADERS),
            );
            if let Some(max_age) = cors.max_age.as_deref().filter(|m| !m.is_empty()) {
                set_header(&mut headers, "access-control-max-age", max_age);
            }
        }
    }

    let (status, body) = if *method == Method::OPTIONS {
        (StatusCode::OK, empty_body())
    } else if let Some(target) = object.redirect() {
        set_header(&mut headers, "location", target);
        let status =
            StatusCode::from_u16(object.redirect_code()).unwrap_or(StatusCode::MOVED_PERMANENTLY);
        (status, empty_body())
    } else {
        let status = StatusCode::from_u16(object.status).unwrap_or(StatusCode::OK);
        let body = match (method, object.body) {
            (&Method::GET, Some(body)) => object_body_to_box_body(body),
            _ => empty_body(),
        };
        (status, body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
