use bucket_proxy::{
    cache_key::CacheKeyPolicy,
    cache_store::{CacheStore, MemoryCacheStore},
    config::{CacheBackend, Config, TokenSource},
    disk_store::DiskCacheStore,
    http_server::{HttpServer, ServerState},
    invalidation::Invalidator,
    logging::LoggerManager,
    resolver::PathResolver,
    shutdown::ShutdownCoordinator,
    storage_client::StorageClient,
    token::{MetadataTokenProvider, StaticTokenProvider, TokenProvider},
    ProxyError, Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn build_cache_store(config: &Config) -> Result<Arc<dyn CacheStore>> {
    let store: Arc<dyn CacheStore> = match config.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryCacheStore::new(config.cache.max_cache_size)),
        CacheBackend::Disk => {
            let disk = Arc::new(DiskCacheStore::new(
                config.cache.cache_dir.clone(),
                config.cache.max_cache_size,
            )?);
            spawn_disk_cleanup(Arc::clone(&disk), config.cache.cleanup_interval);
            disk
        }
    };
    Ok(store)
}

/// Periodic expiry and capacity sweep of the disk store
fn spawn_disk_cleanup(store: Arc<DiskCacheStore>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = store.perform_cache_cleanup().await {
                warn!("Disk cache cleanup failed: {}", e);
            }
        }
    });
}

fn build_token_provider(config: &Config) -> Arc<dyn TokenProvider> {
    match config.storage.token.source {
        TokenSource::Static => Arc::new(StaticTokenProvider::new(
            config.storage.token.static_token.clone().unwrap_or_default(),
        )),
        TokenSource::Metadata => Arc::new(MetadataTokenProvider::new(
            config.storage.token.metadata_url.clone(),
            config.storage.fetch_timeout,
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let logger = LoggerManager::new(
        config.logging.clone(),
        gethostname::gethostname().to_string_lossy().to_string(),
    );
    logger.initialize()?;
    if let Err(e) = logger.rotate_logs() {
        warn!("Failed to remove old log files: {}", e);
    }

    info!("Starting bucket-proxy v{}", env!("CARGO_PKG_VERSION"));

    let store = build_cache_store(&config)?;
    let fetcher = StorageClient::new(config.storage_client_config(), build_token_provider(&config))?;
    let policy = CacheKeyPolicy::new(config.storage.base.clone());

    let resolver = PathResolver::new(
        config.resolver_config(),
        policy.clone(),
        Arc::clone(&store),
        Arc::new(fetcher),
    );
    let invalidator = Invalidator::new(policy, store);

    let listen_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .map_err(|e| {
            ProxyError::ConfigError(format!(
                "Invalid listen address {}:{}: {}",
                config.server.bind_address, config.server.port, e
            ))
        })?;

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let server = HttpServer::new(listen_addr, ServerState::new(&config, resolver, invalidator));
    shutdown_coordinator.set_active_connections(server.active_connections());

    let server_shutdown = shutdown_coordinator.signal();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start(server_shutdown).await {
            error!("HTTP server failed: {}", e);
        }
    });

    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("Shutdown coordinator failed: {}", e);
    }

    // Let the accept loop observe the signal
    if tokio::time::timeout(Duration::from_secs(1), server_task).await.is_err() {
        warn!("HTTP server task did not stop in time");
    }

    info!("bucket-proxy shutdown complete");
    Ok(())
}
