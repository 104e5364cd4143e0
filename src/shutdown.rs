//! Graceful Shutdown Module
//!
//! Signal handling and the shutdown broadcast. On SIGINT or SIGTERM the
//! accept loop is told to stop and in-flight connections get a bounded
//! amount of time to finish.

use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    /// Open client connections, shared with the HTTP server
    active_connections: Option<Arc<AtomicUsize>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            active_connections: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Track a connection counter to drain on shutdown
    pub fn set_active_connections(&mut self, active_connections: Arc<AtomicUsize>) {
        self.active_connections = Some(active_connections);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.subscribe())
    }

    /// Wait for SIGINT or SIGTERM, then shut down
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No receivers left, which is normal once the server has stopped
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    /// Wait for in-flight connections to complete
    async fn perform_shutdown(&self) {
        if let Some(active_connections) = &self.active_connections {
            let active = active_connections.load(Ordering::Relaxed);
            if active > 0 {
                info!("Draining {} active connections", active);
            }
            while active_connections.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("All connections drained");
        }

        // Give a moment for final log messages to be written
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal. A closed or lagged channel also counts.
    pub async fn wait_for_shutdown(&mut self) {
        if let Err(e) = self.receiver.recv().await {
            warn!("Shutdown channel error treated as shutdown: {}", e);
        }
        self.shutdown_requested = true;
    }

    /// Try to receive shutdown signal without blocking
    pub fn try_recv_shutdown(&mut self) -> bool {
        match self.receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => false,
            _ => {
                self.shutdown_requested = true;
                true
            }
        }
    }
}
