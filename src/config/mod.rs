//! Configuration management for Portico
//!
//! Loads and manages gateway configuration from portico.config.json

use crate::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Storage configuration (required)
    pub storage: StorageConfig,

    /// HTTP server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    /// Credential cache tuning
    #[serde(default)]
    pub cache: CacheConfig,

    /// Background watcher tuning
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Handler session registry tuning
    #[serde(default)]
    pub sessions: SessionConfig,

    /// OAuth client behavior
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Per-service settings, keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceEntry>,

    /// Logging configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Driver name (memory, sqlite)
    pub driver: String,

    /// Data source name / connection string
    pub dsn: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Credential cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum entries before LRU pruning kicks in
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Seconds past expiry before cleanup evicts an entry
    #[serde(default = "default_expiry_grace_secs")]
    pub expiry_grace_secs: u64,

    /// Consecutive failed refreshes before an entry is given up on
    #[serde(default = "default_max_refresh_attempts")]
    pub max_refresh_attempts: u32,

    /// Safety margin on the request path: a token expiring within this
    /// window is refreshed before use
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
}

/// Background watcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherConfig {
    /// Seconds between sweep cycles
    #[serde(default = "default_watcher_interval_secs")]
    pub interval_secs: u64,

    /// Tokens expiring within this many seconds get refreshed proactively
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,

    /// Attempt ceiling before the watcher evicts an entry
    #[serde(default = "default_max_refresh_attempts")]
    pub max_attempts: u32,
}

/// Handler session registry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Seconds between idle sweeps
    #[serde(default = "default_session_sweep_secs")]
    pub sweep_interval_secs: u64,

    /// Sessions idle beyond this many seconds are evicted
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,
}

/// OAuth client behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    /// Hard timeout on provider token-endpoint calls, in seconds.
    /// A timed-out refresh is classified as a transient network error.
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
}

/// Static settings for one external service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    /// Upstream endpoint protocol requests are proxied to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Opaque service-specific settings passed through to handlers
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3333
}
fn default_max_entries() -> usize {
    1000
}
fn default_expiry_grace_secs() -> u64 {
    300
}
fn default_max_refresh_attempts() -> u32 {
    3
}
fn default_refresh_margin_secs() -> u64 {
    60
}
fn default_watcher_interval_secs() -> u64 {
    300
}
fn default_refresh_threshold_secs() -> u64 {
    600
}
fn default_session_sweep_secs() -> u64 {
    300
}
fn default_session_idle_secs() -> u64 {
    1800
}
fn default_refresh_timeout_secs() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            expiry_grace_secs: default_expiry_grace_secs(),
            max_refresh_attempts: default_max_refresh_attempts(),
            refresh_margin_secs: default_refresh_margin_secs(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watcher_interval_secs(),
            refresh_threshold_secs: default_refresh_threshold_secs(),
            max_attempts: default_max_refresh_attempts(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_session_sweep_secs(),
            idle_timeout_secs: default_session_idle_secs(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            refresh_timeout_secs: default_refresh_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                driver: "memory".to_string(),
                dsn: String::new(),
            },
            http: Some(HttpConfig::default()),
            cache: CacheConfig::default(),
            watcher: WatcherConfig::default(),
            sessions: SessionConfig::default(),
            oauth: OAuthConfig::default(),
            services: HashMap::new(),
            log: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, applying environment
    /// variable overrides afterwards.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Invalid config file: {}", e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from the default location if present, otherwise defaults
    pub fn load_or_default() -> Result<Self> {
        let path = Path::new("portico.config.json");
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Environment variables win over file values
    fn apply_env_overrides(&mut self) {
        if let Ok(driver) = env::var("PORTICO_STORAGE_DRIVER") {
            self.storage.driver = driver;
        }
        if let Ok(dsn) = env::var("PORTICO_STORAGE_DSN") {
            self.storage.dsn = dsn;
        }
        if let Ok(port) = env::var("PORTICO_PORT")
            && let Ok(port) = port.parse()
        {
            self.http.get_or_insert_with(HttpConfig::default).port = port;
        }
        if let Ok(host) = env::var("PORTICO_HOST") {
            self.http.get_or_insert_with(HttpConfig::default).host = host;
        }
    }
}
