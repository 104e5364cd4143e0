//! Integration tests for path resolution through the storage client
//!
//! Each test runs the resolver against an in-process backend and checks the
//! requests it sends as well as the object it resolves.

mod common;

use bucket_proxy::cache_key::CacheKeyPolicy;
use bucket_proxy::cache_store::{CacheStore, MemoryCacheStore};
use bucket_proxy::invalidation::Invalidator;
use bucket_proxy::ProxyError;
use common::{resolver, FakeBackend, FakeObject, TOKEN};
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method};
use std::sync::Arc;

fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(*name, HeaderValue::from_static(value));
    }
    map
}

async fn body_text(object: bucket_proxy::object::Object) -> String {
    let body = object.body.unwrap().into_bytes().await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_trailing_slash_serves_index() {
    let backend = FakeBackend::start().await;
    backend.put("/main/docs/index.html", "docs home");
    let store = Arc::new(MemoryCacheStore::new(1 << 20));
    let resolver = resolver(&backend.base(), store);

    let object = resolver
        .resolve_with_deadline("main", "docs/", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(body_text(object).await, "docs home");
    assert_eq!(backend.count(Method::GET, "/main/docs/index.html"), 1);
    assert_eq!(backend.requests().iter().filter(|r| r.method == Method::HEAD).count(), 0);
}

#[tokio::test]
async fn test_root_serves_index() {
    let backend = FakeBackend::start().await;
    backend.put("/main/index.html", "home");
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let object = resolver
        .resolve_with_deadline("main", "", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(body_text(object).await, "home");
}

#[tokio::test]
async fn test_directory_without_slash_redirects() {
    let backend = FakeBackend::start().await;
    backend.put("/main/docs/index.html", "docs home");
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let object = resolver
        .resolve_with_deadline("main", "docs", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(object.redirect(), Some("/docs/"));
    assert_eq!(object.redirect_code(), 301);
    assert_eq!(backend.count(Method::GET, "/main/docs"), 1);
    assert_eq!(backend.count(Method::HEAD, "/main/docs/index.html"), 1);
}

#[tokio::test]
async fn test_directory_redirect_when_backend_forbids() {
    let backend = FakeBackend::start().await;
    backend.set_missing_status(403);
    backend.put("/main/docs/index.html", "docs home");
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let object = resolver
        .resolve_with_deadline("main", "docs", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(object.redirect(), Some("/docs/"));
}

#[tokio::test]
async fn test_missing_object_and_index_is_not_found() {
    let backend = FakeBackend::start().await;
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let err = resolver
        .resolve_with_deadline("main", "nothing", &HeaderMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(err.to_string().contains("No such object"));
}

#[tokio::test]
async fn test_name_with_extension_skips_index_stat() {
    let backend = FakeBackend::start().await;
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let err = resolver
        .resolve_with_deadline("main", "missing.css", &HeaderMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.fetch_code(), Some(404));
    assert_eq!(backend.requests().iter().filter(|r| r.method == Method::HEAD).count(), 0);
}

#[tokio::test]
async fn test_other_backend_errors_pass_through() {
    let backend = FakeBackend::start().await;
    backend.put_object("/main/broken", FakeObject::new("bad").status(400));
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let err = resolver
        .resolve_with_deadline("main", "broken", &HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Fetch { code: 400, .. }));
}

#[tokio::test]
async fn test_requests_carry_token_and_gzip() {
    let backend = FakeBackend::start().await;
    backend.put("/main/a.txt", "a");
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    resolver
        .resolve_with_deadline("main", "a.txt", &HeaderMap::new())
        .await
        .unwrap();
    let request = &backend.requests()[0];
    assert_eq!(request.header("authorization"), Some(format!("Bearer {}", TOKEN).as_str()));
    assert_eq!(request.header("accept-encoding"), Some("gzip"));
}

#[tokio::test]
async fn test_second_get_is_served_from_cache() {
    let backend = FakeBackend::start().await;
    backend.put("/main/a.txt", "cached");
    let store = Arc::new(MemoryCacheStore::new(1 << 20));
    let resolver = resolver(&backend.base(), Arc::clone(&store));

    for _ in 0..2 {
        let object = resolver
            .resolve_with_deadline("main", "a.txt", &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(body_text(object).await, "cached");
    }
    assert_eq!(backend.count(Method::GET, "/main/a.txt"), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_range_and_conditional_requests_bypass_cache() {
    let backend = FakeBackend::start().await;
    backend.put("/main/a.txt", "0123456789");
    let store = Arc::new(MemoryCacheStore::new(1 << 20));
    let resolver = resolver(&backend.base(), Arc::clone(&store));

    let object = resolver
        .resolve_with_deadline("main", "a.txt", &headers(&[("range", "bytes=0-3")]))
        .await
        .unwrap();
    assert_eq!(object.status, 206);
    assert_eq!(object.meta.content_range.as_deref(), Some("bytes 0-3/10"));
    assert_eq!(body_text(object).await, "0123");

    resolver
        .resolve_with_deadline("main", "a.txt", &headers(&[("if-none-match", "\"x\"")]))
        .await
        .unwrap();

    assert_eq!(backend.count(Method::GET, "/main/a.txt"), 2);
    assert!(store.is_empty());
    let forwarded = backend.requests();
    assert_eq!(forwarded[0].header("range"), Some("bytes=0-3"));
    assert_eq!(forwarded[1].header("if-none-match"), Some("\"x\""));
}

#[tokio::test]
async fn test_gzip_body_decoded_for_plain_clients() {
    let backend = FakeBackend::start().await;
    backend.put_object("/main/app.js", FakeObject::new("console.log(1)").gzip());
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let plain = resolver
        .resolve_with_deadline("main", "app.js", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(plain.meta.content_encoding, None);
    assert_eq!(body_text(plain).await, "console.log(1)");

    let gzipped = resolver
        .resolve_with_deadline("main", "app.js", &headers(&[("accept-encoding", "gzip")]))
        .await
        .unwrap();
    assert_eq!(gzipped.meta.content_encoding.as_deref(), Some("gzip"));
    let raw = gzipped.body.unwrap().into_bytes().await.unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    // Each representation has its own cache entry
    assert_eq!(backend.count(Method::GET, "/main/app.js"), 2);
}

#[tokio::test]
async fn test_purge_forces_live_fetch() {
    let backend = FakeBackend::start().await;
    backend.put("/main/page.html", "v1");
    let store = Arc::new(MemoryCacheStore::new(1 << 20));
    let resolver = resolver(&backend.base(), Arc::clone(&store));
    let gzip = headers(&[("accept-encoding", "gzip")]);

    resolver.resolve_with_deadline("main", "page.html", &HeaderMap::new()).await.unwrap();
    resolver.resolve_with_deadline("main", "page.html", &gzip).await.unwrap();
    assert_eq!(store.len(), 2);

    backend.put("/main/page.html", "v2");
    let invalidator = Invalidator::new(CacheKeyPolicy::new(backend.base()), store.clone());
    invalidator.purge("main", "page.html").await.unwrap();
    assert!(store.is_empty());

    let object = resolver
        .resolve_with_deadline("main", "page.html", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(body_text(object).await, "v2");
    assert_eq!(backend.count(Method::GET, "/main/page.html"), 3);
}

#[tokio::test]
async fn test_redirect_metadata_on_object() {
    let backend = FakeBackend::start().await;
    backend.put_object(
        "/main/old",
        FakeObject::new("")
            .header("x-goog-meta-redirect", "https://example.com/new")
            .header("x-goog-meta-redirect-code", "302"),
    );
    let store = Arc::new(MemoryCacheStore::new(1 << 20));
    let resolver = resolver(&backend.base(), Arc::clone(&store));

    let object = resolver
        .resolve_with_deadline("main", "old", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(object.redirect(), Some("https://example.com/new"));
    assert_eq!(object.redirect_code(), 302);

    let key = CacheKeyPolicy::new(backend.base()).base_key("main", "old");
    let cached = store.get(&key).await.unwrap();
    assert_eq!(cached.redirect(), Some("https://example.com/new"));
}

#[tokio::test]
async fn test_names_cannot_escape_bucket() {
    let backend = FakeBackend::start().await;
    backend.put("/main/etc/passwd.txt", "inside");
    let resolver = resolver(&backend.base(), Arc::new(MemoryCacheStore::new(1 << 20)));

    let object = resolver
        .resolve_with_deadline("main", "../../etc/passwd.txt", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(body_text(object).await, "inside");
}
