//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! The YAML file is applied first, then environment variables, then CLI flags.

use crate::resolver::ResolverConfig;
use crate::serve::CorsConfig;
use crate::storage_client::{StorageClientConfig, STREAMING_THRESHOLD};
use crate::token::METADATA_TOKEN_URL;
use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.filter(|s| !s.is_empty()).map(|s| expand_tilde(&s)))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom (de)serializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "d" | "day" | "days" => Duration::from_secs_f64(value * 86400.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Host to bucket mapping; must contain a `default` entry
    #[serde(default)]
    pub buckets: HashMap<String, String>,
    /// Host (optionally with a path prefix) to redirect target.
    /// Targets must not end with `/` or carry a query string.
    #[serde(default)]
    pub redirects: HashMap<String, String>,
    #[serde(default = "default_cors")]
    pub cors: CorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Budget for resolving one request
    #[serde(
        with = "duration_serde",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
    /// Change notification webhook path
    #[serde(default = "default_hook_path")]
    pub hook_path: String,
    /// Hosts only served over TLS (judged by `x-forwarded-proto`)
    #[serde(default)]
    pub tls_only: Vec<String>,
    #[serde(
        with = "duration_serde",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_hook_path() -> String {
    "/-/hook/gcs".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            hook_path: default_hook_path(),
            tls_only: Vec::new(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Backend storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend base URL
    #[serde(default = "default_storage_base")]
    pub base: String,
    /// Directory index object name
    #[serde(default = "default_index")]
    pub index: String,
    /// Largest body cached, also the streaming threshold
    #[serde(default = "default_cache_ceiling")]
    pub cache_ceiling: u64,
    #[serde(with = "duration_serde", default = "default_cache_ttl")]
    pub cache_ttl: Duration,
    #[serde(with = "duration_serde", default = "default_stat_timeout")]
    pub stat_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,
    #[serde(default)]
    pub token: TokenConfig,
}

fn default_storage_base() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_cache_ceiling() -> u64 {
    STREAMING_THRESHOLD
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_stat_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base: default_storage_base(),
            index: default_index(),
            cache_ceiling: default_cache_ceiling(),
            cache_ttl: default_cache_ttl(),
            stat_timeout: default_stat_timeout(),
            fetch_timeout: default_fetch_timeout(),
            token: TokenConfig::default(),
        }
    }
}

/// Where backend access tokens come from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum TokenSource {
    #[default]
    #[serde(rename = "metadata")]
    Metadata,
    #[serde(rename = "static")]
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub source: TokenSource,
    /// Token used when `source` is `static`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_token: Option<String>,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
}

fn default_metadata_url() -> String {
    METADATA_TOKEN_URL.to_string()
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            source: TokenSource::default(),
            static_token: None,
            metadata_url: default_metadata_url(),
        }
    }
}

/// Cache store selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum CacheBackend {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "disk")]
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Directory of the disk store
    #[serde(
        deserialize_with = "pathbuf_serde::deserialize",
        default = "default_cache_dir"
    )]
    pub cache_dir: PathBuf,
    /// Size bound of the cache store in bytes
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    /// Period of the disk store's expiry and capacity sweep
    #[serde(with = "duration_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_max_cache_size() -> u64 {
    256 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            cache_dir: default_cache_dir(),
            max_cache_size: default_max_cache_size(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_cors() -> CorsConfig {
    CorsConfig {
        origin: vec!["*".to_string()],
        max_age: Some("86400".to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(
        default,
        deserialize_with = "pathbuf_serde::deserialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub app_log_dir: Option<PathBuf>,
    /// Days of log files kept on startup cleanup
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            buckets: HashMap::new(),
            redirects: HashMap::new(),
            cors: default_cors(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches, |name| std::env::var(name).ok())
    }

    /// Build configuration from parsed arguments and an environment lookup
    pub fn from_matches<F>(matches: &clap::ArgMatches, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides(env);

        // Override with command line arguments
        config.apply_cli_overrides(matches);

        config.validate()?;

        info!(
            "Serving buckets {:?} from {} (index={}, cache_ttl={}s, cache_ceiling={} bytes)",
            config.buckets,
            config.storage.base,
            config.storage.index,
            config.storage.cache_ttl.as_secs(),
            config.storage.cache_ceiling
        );
        match config.cache.backend {
            CacheBackend::Memory => info!(
                "Memory cache store (max_cache_size={} bytes)",
                config.cache.max_cache_size
            ),
            CacheBackend::Disk => info!(
                "Disk cache store at {:?} (max_cache_size={} bytes, cleanup_interval={:?})",
                config.cache.cache_dir, config.cache.max_cache_size, config.cache.cleanup_interval
            ),
        }

        info!("Configuration loaded successfully");
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("bucket-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Caching HTTP frontend for object storage buckets")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("storage-base")
                    .long("storage-base")
                    .value_name("URL")
                    .help("Storage backend base URL (default: https://storage.googleapis.com)"),
            )
            .arg(
                Arg::new("default-bucket")
                    .long("default-bucket")
                    .value_name("BUCKET")
                    .help("Bucket served for hosts without a mapping"),
            )
            .arg(
                Arg::new("cache-backend")
                    .long("cache-backend")
                    .value_name("BACKEND")
                    .help("Cache store: memory (default) or disk"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Disk cache directory path"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (default: info)"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    fn parse_cache_backend(value: &str) -> Option<CacheBackend> {
        match value.to_lowercase().as_str() {
            "memory" => Some(CacheBackend::Memory),
            "disk" => Some(CacheBackend::Disk),
            _ => None,
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = env("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Some(base) = env("STORAGE_BASE") {
            self.storage.base = base;
        }

        if let Some(bucket) = env("DEFAULT_BUCKET") {
            self.buckets.insert("default".to_string(), bucket);
        }

        if let Some(token) = env("STATIC_TOKEN") {
            self.storage.token.source = TokenSource::Static;
            self.storage.token.static_token = Some(token);
        }

        if let Some(backend) = env("CACHE_BACKEND") {
            if let Some(backend) = Self::parse_cache_backend(&backend) {
                self.cache.backend = backend;
            }
        }

        if let Some(cache_dir) = env("CACHE_DIR") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(&cache_dir);
        }

        if let Some(app_log_dir) = env("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(pathbuf_serde::expand_tilde(&app_log_dir));
        }

        if let Some(level) = env("LOG_LEVEL") {
            self.logging.log_level = level;
        }
    }

    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Some(base) = matches.get_one::<String>("storage-base") {
            self.storage.base = base.clone();
        }

        if let Some(bucket) = matches.get_one::<String>("default-bucket") {
            self.buckets.insert("default".to_string(), bucket.clone());
        }

        if let Some(backend) = matches.get_one::<String>("cache-backend") {
            if let Some(backend) = Self::parse_cache_backend(backend) {
                self.cache.backend = backend;
            }
        }

        if let Some(cache_dir) = matches.get_one::<String>("cache-dir") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(cache_dir);
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
    }

    /// Reject configurations the proxy cannot serve with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ProxyError::ConfigError(msg));

        if self.buckets.get("default").map_or(true, |b| b.is_empty()) {
            return invalid("buckets must contain a non-empty \"default\" entry".to_string());
        }
        if self.storage.index.is_empty() || self.storage.index.contains('/') {
            return invalid(format!(
                "storage.index must be a plain object name, got {:?}",
                self.storage.index
            ));
        }
        if !self.storage.base.starts_with("http://") && !self.storage.base.starts_with("https://")
        {
            return invalid(format!(
                "storage.base must be an http(s) URL, got {:?}",
                self.storage.base
            ));
        }
        if self.storage.cache_ceiling == 0 {
            return invalid("storage.cache_ceiling must be greater than zero".to_string());
        }
        if self.cache.cleanup_interval.is_zero() {
            return invalid("cache.cleanup_interval must be greater than zero".to_string());
        }
        if self.storage.token.source == TokenSource::Static
            && self.storage.token.static_token.as_deref().map_or(true, str::is_empty)
        {
            return invalid("storage.token.static_token is required for the static source".to_string());
        }
        if !self.server.hook_path.starts_with('/') {
            return invalid(format!(
                "server.hook_path must start with '/', got {:?}",
                self.server.hook_path
            ));
        }
        for (from, target) in &self.redirects {
            if target.ends_with('/') || target.contains('?') {
                return invalid(format!(
                    "redirect target for {} must not end with '/' or contain a query: {}",
                    from, target
                ));
            }
        }
        Ok(())
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            index: self.storage.index.clone(),
            cache_ceiling: self.storage.cache_ceiling,
            cache_ttl: self.storage.cache_ttl,
            stat_timeout: self.storage.stat_timeout,
            request_deadline: self.server.request_timeout,
        }
    }

    pub fn storage_client_config(&self) -> StorageClientConfig {
        StorageClientConfig {
            base: self.storage.base.clone(),
            request_timeout: self.storage.fetch_timeout,
            streaming_threshold: self.storage.cache_ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config
            .buckets
            .insert("default".to_string(), "my-bucket".to_string());
        config
    }

    #[test]
    fn test_duration_parsing() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3 weeks").is_err());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
server:
  port: 9000
  request_timeout: "15s"
  tls_only: ["secure.example.com"]
storage:
  base: "http://127.0.0.1:4443"
  index: "default.htm"
  cache_ttl: "10m"
  token:
    source: "static"
    static_token: "dev"
cache:
  backend: "disk"
  cache_dir: "/var/cache/bucket-proxy"
  max_cache_size: 1048576
  cleanup_interval: "15m"
buckets:
  default: "site-bucket"
  docs.example.com: "docs-bucket"
redirects:
  old.example.com: "https://new.example.com"
cors:
  origin: ["https://a.example"]
logging:
  log_level: "debug"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.request_timeout, Duration::from_secs(15));
        assert_eq!(config.server.hook_path, "/-/hook/gcs");
        assert_eq!(config.storage.index, "default.htm");
        assert_eq!(config.storage.cache_ttl, Duration::from_secs(600));
        assert_eq!(config.storage.stat_timeout, Duration::from_secs(5));
        assert_eq!(config.storage.token.source, TokenSource::Static);
        assert_eq!(config.cache.backend, CacheBackend::Disk);
        assert_eq!(config.cache.max_cache_size, 1024 * 1024);
        assert_eq!(config.cache.cleanup_interval, Duration::from_secs(900));
        assert_eq!(config.buckets["docs.example.com"], "docs-bucket");
        assert_eq!(config.cors.origin, vec!["https://a.example".to_string()]);
        assert_eq!(config.cors.max_age, None);
        assert_eq!(config.logging.log_level, "debug");

        let resolver = config.resolver_config();
        assert_eq!(resolver.request_deadline, Duration::from_secs(15));
        assert_eq!(resolver.cache_ceiling, STREAMING_THRESHOLD);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cors.origin, vec!["*".to_string()]);
        assert_eq!(config.cors.max_age.as_deref(), Some("86400"));
        assert_eq!(config.storage.base, "https://storage.googleapis.com");
        assert_eq!(config.storage.cache_ttl, Duration::from_secs(86400));
        assert_eq!(config.server.request_timeout, Duration::from_secs(10));
        assert_eq!(config.cache.backend, CacheBackend::Memory);
    }

    #[test]
    fn test_validation() {
        assert!(Config::default().validate().is_err());
        valid_config().validate().unwrap();

        let mut config = valid_config();
        config.storage.index = "dir/index.html".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config
            .redirects
            .insert("old.example.com".to_string(), "https://new.example.com/".to_string());
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.storage.token.source = TokenSource::Static;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.storage.base = "storage.googleapis.com".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.cache.cleanup_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buckets:\n  default: from-file\nserver:\n  port: 7000").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let env = |name: &str| match name {
            "PORT" => Some("7100".to_string()),
            "CACHE_BACKEND" => Some("disk".to_string()),
            "STATIC_TOKEN" => Some("env-token".to_string()),
            _ => None,
        };
        let matches = Config::build_cli()
            .try_get_matches_from(["bucket-proxy", "-c", &path, "--port", "7200"])
            .unwrap();
        let config = Config::from_matches(&matches, env).unwrap();

        assert_eq!(config.server.port, 7200);
        assert_eq!(config.buckets["default"], "from-file");
        assert_eq!(config.cache.backend, CacheBackend::Disk);
        assert_eq!(config.storage.token.static_token.as_deref(), Some("env-token"));
    }

    #[test]
    fn test_missing_config_file() {
        let matches = Config::build_cli()
            .try_get_matches_from(["bucket-proxy", "-c", "/nonexistent/bucket-proxy.yaml"])
            .unwrap();
        let err = Config::from_matches(&matches, no_env).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }
}
