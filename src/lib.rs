//! Bucket Proxy - Caching HTTP frontend for object storage buckets
//!
//! This library provides the core functionality for the proxy server:
//! host to bucket routing, directory index resolution, read-through caching
//! with variant cache keys, and change-notification driven invalidation.

pub mod backend_connector;
pub mod cache_key;
pub mod cache_store;
pub mod config;
pub mod disk_store;
pub mod error;
pub mod http_server;
pub mod invalidation;
pub mod logging;
pub mod object;
pub mod paths;
pub mod resolver;
pub mod serve;
pub mod shutdown;
pub mod storage_client;
pub mod token;

pub use error::{ProxyError, Result};
