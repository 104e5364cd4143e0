//! Logging Module
//!
//! Application logging through `tracing`: a console layer plus, when a log
//! directory is configured, a daily rolling file under `{app_log_dir}/{hostname}`.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "bucket-proxy.log";

/// Logger manager for application logging
pub struct LoggerManager {
    pub config: LoggingConfig,
    pub hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Host-specific log directory, if file logging is enabled
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Initialize the logging system
    pub fn initialize(&self) -> Result<()> {
        self.setup_application_logging()?;
        info!("Logging system initialized");
        Ok(())
    }

    /// Setup application logging with tracing
    fn setup_application_logging(&self) -> Result<()> {
        let host_log_dir = self.host_log_dir();

        let file_layer = match &host_log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, dir.clone(), LOG_FILE_PREFIX);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG overrides the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = &host_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Remove log files older than the retention period
    pub fn rotate_logs(&self) -> Result<usize> {
        let Some(dir) = self.host_log_dir() else {
            return Ok(0);
        };
        let keep = Duration::from_secs(u64::from(self.config.log_retention_days) * 24 * 3600);
        let removed = cleanup_old_logs(&dir, keep);
        if removed > 0 {
            info!("Removed {} log files older than {} days", removed, self.config.log_retention_days);
        }
        Ok(removed)
    }
}

/// Delete files in `log_dir` last modified before `now - keep`
fn cleanup_old_logs(log_dir: &Path, keep: Duration) -> usize {
    let Some(cutoff_time) = SystemTime::now().checked_sub(keep) else {
        return 0;
    };

    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let modified = entry.metadata().and_then(|m| m.modified());
            if let Ok(modified) = modified {
                if modified < cutoff_time {
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
                    } else {
                        debug!("Removed old log file: {:?}", entry.path());
                        removed += 1;
                    }
                }
            }
        }
    }
    removed
}
