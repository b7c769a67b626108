//! Configuration loading.
//!
//! Settings are layered, later sources winning:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. An optional TOML file (`--config <path>`, otherwise the platform config
//!    directory, e.g. `~/.config/regscan/config.toml` on Linux)
//! 3. `REGSCAN_*` environment variables
//!
//! The merged result is validated before the orchestrator starts; any problem
//! is a [`ConfigError`] and stops the process.
//!
//! # Example Configuration
//!
//! ```toml
//! [registry]
//! url = "https://harbor.example.com"
//! username = "robot$scanner"
//!
//! [scanner]
//! url = "http://trivy.scanning.svc:8080"
//! timeout_secs = 900
//!
//! [cache]
//! host = "redis.scanning.svc"
//!
//! [broker]
//! host = "rabbitmq.scanning.svc"
//! queue = "scan_queue"
//!
//! [schedule]
//! poll_interval_secs = 300
//! cache_ttl_secs = 604800
//! ```
//!
//! Credentials are normally left out of the file and supplied through
//! `REGSCAN_REGISTRY_PASSWORD`, `REGSCAN_SCANNER_TOKEN`,
//! `REGSCAN_CACHE_PASSWORD` and `REGSCAN_BROKER_PASSWORD`.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest `page_size` Harbor honors; bigger values are silently truncated.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A credential whose value never shows up in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub scanner: ScannerConfig,
    pub cache: CacheConfig,
    pub broker: BrokerConfig,
    pub schedule: ScheduleConfig,
}

/// Registry (Harbor) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the registry, without the `/api/v2.0` suffix.
    pub url: String,

    /// Basic-auth user. Default: `admin`
    pub username: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,

    /// Per-request timeout. Default: 30 seconds
    pub timeout_secs: u64,

    /// Page size used for every paginated listing, at most 100. Default: 100
    pub page_size: u32,
}

/// Vulnerability scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Secret>,

    /// Upper bound for a single image scan. Default: 600 seconds
    pub timeout_secs: u64,
}

/// Dedup cache (Redis) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,

    pub db: u32,

    /// Per-command timeout. Default: 5 seconds
    pub timeout_secs: u64,
}

/// Job queue (AMQP broker) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,

    pub vhost: String,

    /// Durable queue that receives scan results. Default: `scan_queue`
    pub queue: String,

    pub heartbeat_secs: u16,

    /// Timeout for one publish including the broker confirm. Default: 10 seconds
    pub timeout_secs: u64,

    /// Total publish attempts before a result is reported as unpublished.
    pub publish_max_attempts: u32,

    pub publish_initial_backoff_ms: u64,
    pub publish_max_backoff_ms: u64,
}

/// Polling cadence and dedup window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Sleep between successful cycles. Default: 300 seconds
    pub poll_interval_secs: u64,

    /// Retention window for the "already scanned" marker. Default: 7 days
    pub cache_ttl_secs: u64,

    /// Sleep after a failed cycle. Default: 60 seconds
    pub error_backoff_secs: u64,

    /// Concurrent scans per project. Default: 4
    pub max_concurrent_scans: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: "admin".to_string(),
            password: None,
            timeout_secs: 30,
            page_size: 100,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            timeout_secs: 600,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            timeout_secs: 5,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: None,
            vhost: "/".to_string(),
            queue: "scan_queue".to_string(),
            heartbeat_secs: 600,
            timeout_secs: 10,
            publish_max_attempts: 5,
            publish_initial_backoff_ms: 500,
            publish_max_backoff_ms: 30_000,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            cache_ttl_secs: 7 * 24 * 3600,
            error_backoff_secs: 60,
            max_concurrent_scans: 4,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CacheConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the `redis://` connection URL, embedding the password if set.
    pub fn redis_url(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.db))
            .map_err(|e| ConfigError::invalid("cache.host", e.to_string()))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose()))
                .map_err(|_| ConfigError::invalid("cache.password", "cannot be embedded in URL"))?;
        }
        Ok(url.to_string())
    }
}

impl BrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the `amqp://` URI including credentials, vhost and heartbeat.
    pub fn amqp_uri(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&format!("amqp://{}:{}/", self.host, self.port))
            .map_err(|e| ConfigError::invalid("broker.host", e.to_string()))?;
        url.set_username(&self.username)
            .map_err(|_| ConfigError::invalid("broker.username", "cannot be embedded in URI"))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose()))
                .map_err(|_| ConfigError::invalid("broker.password", "cannot be embedded in URI"))?;
        }
        let vhost = self.vhost.replace('%', "%25").replace('/', "%2f");
        url.set_path(&format!("/{vhost}"));
        url.set_query(Some(&format!("heartbeat={}", self.heartbeat_secs)));
        Ok(url.to_string())
    }
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl Config {
    /// Loads defaults, the config file and the process environment, then
    /// validates the result.
    ///
    /// An explicit `path` must exist. Without one, the default config path is
    /// used only if the file is present.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, an
    /// environment variable holds an unparsable value, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file without applying the environment or validating.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlays `REGSCAN_*` variables resolved through `lookup`.
    ///
    /// Empty values are treated as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        set_string(&get, "REGSCAN_REGISTRY_URL", &mut self.registry.url);
        set_string(&get, "REGSCAN_REGISTRY_USERNAME", &mut self.registry.username);
        set_secret(&get, "REGSCAN_REGISTRY_PASSWORD", &mut self.registry.password);
        set_parsed(&get, "REGSCAN_REGISTRY_TIMEOUT_SECS", &mut self.registry.timeout_secs)?;
        set_parsed(&get, "REGSCAN_REGISTRY_PAGE_SIZE", &mut self.registry.page_size)?;

        set_string(&get, "REGSCAN_SCANNER_URL", &mut self.scanner.url);
        set_secret(&get, "REGSCAN_SCANNER_TOKEN", &mut self.scanner.token);
        set_parsed(&get, "REGSCAN_SCANNER_TIMEOUT_SECS", &mut self.scanner.timeout_secs)?;

        set_string(&get, "REGSCAN_CACHE_HOST", &mut self.cache.host);
        set_parsed(&get, "REGSCAN_CACHE_PORT", &mut self.cache.port)?;
        set_secret(&get, "REGSCAN_CACHE_PASSWORD", &mut self.cache.password);
        set_parsed(&get, "REGSCAN_CACHE_DB", &mut self.cache.db)?;
        set_parsed(&get, "REGSCAN_CACHE_TIMEOUT_SECS", &mut self.cache.timeout_secs)?;

        set_string(&get, "REGSCAN_BROKER_HOST", &mut self.broker.host);
        set_parsed(&get, "REGSCAN_BROKER_PORT", &mut self.broker.port)?;
        set_string(&get, "REGSCAN_BROKER_USERNAME", &mut self.broker.username);
        set_secret(&get, "REGSCAN_BROKER_PASSWORD", &mut self.broker.password);
        set_string(&get, "REGSCAN_BROKER_VHOST", &mut self.broker.vhost);
        set_string(&get, "REGSCAN_BROKER_QUEUE", &mut self.broker.queue);
        set_parsed(&get, "REGSCAN_BROKER_HEARTBEAT_SECS", &mut self.broker.heartbeat_secs)?;
        set_parsed(&get, "REGSCAN_BROKER_TIMEOUT_SECS", &mut self.broker.timeout_secs)?;
        set_parsed(&get, "REGSCAN_PUBLISH_MAX_ATTEMPTS", &mut self.broker.publish_max_attempts)?;
        set_parsed(
            &get,
            "REGSCAN_PUBLISH_INITIAL_BACKOFF_MS",
            &mut self.broker.publish_initial_backoff_ms,
        )?;
        set_parsed(
            &get,
            "REGSCAN_PUBLISH_MAX_BACKOFF_MS",
            &mut self.broker.publish_max_backoff_ms,
        )?;

        set_parsed(&get, "REGSCAN_POLL_INTERVAL_SECS", &mut self.schedule.poll_interval_secs)?;
        set_parsed(&get, "REGSCAN_CACHE_TTL_SECS", &mut self.schedule.cache_ttl_secs)?;
        set_parsed(&get, "REGSCAN_ERROR_BACKOFF_SECS", &mut self.schedule.error_backoff_secs)?;
        set_parsed(
            &get,
            "REGSCAN_MAX_CONCURRENT_SCANS",
            &mut self.schedule.max_concurrent_scans,
        )?;

        Ok(())
    }

    /// Checks that required settings are present and numeric settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("registry.url", &self.registry.url)?;
        validate_url("scanner.url", &self.scanner.url)?;

        require_positive("registry.timeout_secs", self.registry.timeout_secs)?;
        require_positive("registry.page_size", u64::from(self.registry.page_size))?;
        if self.registry.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::invalid(
                "registry.page_size",
                format!("must not exceed {MAX_PAGE_SIZE}"),
            ));
        }
        require_positive("scanner.timeout_secs", self.scanner.timeout_secs)?;
        require_positive("cache.timeout_secs", self.cache.timeout_secs)?;
        require_positive("broker.timeout_secs", self.broker.timeout_secs)?;
        require_positive(
            "broker.publish_max_attempts",
            u64::from(self.broker.publish_max_attempts),
        )?;
        require_positive("schedule.poll_interval_secs", self.schedule.poll_interval_secs)?;
        require_positive("schedule.cache_ttl_secs", self.schedule.cache_ttl_secs)?;
        require_positive("schedule.error_backoff_secs", self.schedule.error_backoff_secs)?;
        require_positive(
            "schedule.max_concurrent_scans",
            self.schedule.max_concurrent_scans as u64,
        )?;

        if self.cache.host.trim().is_empty() {
            return Err(ConfigError::Missing("cache.host"));
        }
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Missing("broker.host"));
        }
        if self.broker.queue.trim().is_empty() {
            return Err(ConfigError::Missing("broker.queue"));
        }
        if self.broker.publish_initial_backoff_ms > self.broker.publish_max_backoff_ms {
            return Err(ConfigError::invalid(
                "broker.publish_initial_backoff_ms",
                "must not exceed broker.publish_max_backoff_ms",
            ));
        }

        Ok(())
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default location of the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("regscan")
            .join("config.toml")
    }

    /// Renders the default configuration as TOML.
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn set_string<G>(get: &G, key: &str, target: &mut String)
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(key) {
        *target = value;
    }
}

fn set_secret<G>(get: &G, key: &str, target: &mut Option<Secret>)
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(key) {
        *target = Some(Secret::new(value));
    }
}

fn set_parsed<G, T>(get: &G, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(value) = get(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("{value:?}: {e}")))?;
    }
    Ok(())
}

fn validate_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(key));
    }
    let url = Url::parse(value).map_err(|e| ConfigError::invalid(key, e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(key, "scheme must be http or https"));
    }
    Ok(())
}

fn require_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(())
}
