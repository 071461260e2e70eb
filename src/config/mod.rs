//! Configuration management for sienge-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Deployment posture
    #[serde(default)]
    pub environment: Environment,

    /// Control API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Rate budget for outbound calls
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry policy for outbound calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Pagination ceilings
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Credential vault configuration
    #[serde(default)]
    pub vault: VaultConfig,

    /// Validation cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix SIENGE_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(env) = std::env::var("SIENGE_SYNC_ENVIRONMENT") {
            config.environment = env.parse()?;
        }

        // Server config from env
        if let Ok(host) = std::env::var("SIENGE_SYNC_SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("SIENGE_SYNC_SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid port number".to_string()))?;
        }

        // Upstream config from env
        if let Ok(url) = std::env::var("SIENGE_SYNC_UPSTREAM_BASE_URL") {
            config.upstream.base_url = url;
        }
        if let Ok(size) = std::env::var("SIENGE_SYNC_UPSTREAM_PAGE_SIZE") {
            config.upstream.page_size = parse_number("SIENGE_SYNC_UPSTREAM_PAGE_SIZE", &size)?;
        }

        // Rate limit config from env
        if let Ok(value) = std::env::var("SIENGE_SYNC_RATE_LIMIT_MAX_CONCURRENT") {
            config.rate_limit.max_concurrent =
                parse_number("SIENGE_SYNC_RATE_LIMIT_MAX_CONCURRENT", &value)?;
        }
        if let Ok(value) = std::env::var("SIENGE_SYNC_RATE_LIMIT_MIN_INTERVAL_MS") {
            config.rate_limit.min_interval_ms =
                parse_number("SIENGE_SYNC_RATE_LIMIT_MIN_INTERVAL_MS", &value)?;
        }

        // Retry config from env
        if let Ok(value) = std::env::var("SIENGE_SYNC_RETRY_MAX_RETRIES") {
            config.retry.max_retries = parse_number("SIENGE_SYNC_RETRY_MAX_RETRIES", &value)?;
        }

        // Vault config from env
        if let Ok(key) = std::env::var("SIENGE_SYNC_VAULT_MASTER_KEY")
            .or_else(|_| std::env::var("ENCRYPTION_MASTER_KEY"))
        {
            config.vault.master_key = Some(key);
        }

        // Database config from env
        if let Ok(path) = std::env::var("SIENGE_SYNC_DATABASE_PATH") {
            config.database.path = path;
        }

        // OTEL config from env
        if let Ok(enabled) = std::env::var("SIENGE_SYNC_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("SIENGE_SYNC_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        // Logging config from env
        if let Ok(level) = std::env::var("SIENGE_SYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("SIENGE_SYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.max_queue == 0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.max_queue must be at least 1".to_string(),
            ));
        }
        if self.upstream.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "upstream.page_size must be at least 1".to_string(),
            ));
        }
        if self.pagination.max_pages == 0 {
            return Err(ConfigError::InvalidValue(
                "pagination.max_pages must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.otel.enabled && self.otel.endpoint.is_none() {
            return Err(ConfigError::MissingRequired(
                "otel.endpoint is required when otel.enabled is true".to_string(),
            ));
        }
        Ok(())
    }

    /// Validation cache TTL for the configured posture
    pub fn cache_ttl(&self) -> Duration {
        match self.environment {
            Environment::Development => Duration::from_secs(self.cache.ttl_development_secs),
            Environment::Production => Duration::from_secs(self.cache.ttl_production_secs),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Parse(format!("Invalid numeric value for {}", name)))
}

/// Deployment posture
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Control API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL; `{subdomain}` is replaced by the tenant subdomain
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds (connect + response)
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Credentials used in development when none are stored
    #[serde(default)]
    pub fallback_credentials: Option<FallbackCredentials>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_upstream_timeout(),
            user_agent: default_user_agent(),
            page_size: default_page_size(),
            fallback_credentials: None,
        }
    }
}

impl UpstreamConfig {
    /// Base URL for a tenant, without a trailing slash
    pub fn base_url_for(&self, subdomain: &str) -> String {
        self.base_url
            .replace("{subdomain}", subdomain)
            .trim_end_matches('/')
            .to_string()
    }
}

fn default_base_url() -> String {
    "https://api.sienge.com.br/{subdomain}/public/api/v1".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("sienge-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_page_size() -> usize {
    200
}

/// Plaintext credentials accepted only in the development posture
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackCredentials {
    pub subdomain: String,
    pub username: String,
    pub password: String,
}

/// Retry configuration for upstream API calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    false
}

/// Rate limiting configuration for the upstream client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Minimum interval between dispatches in milliseconds
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Maximum number of concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of requests waiting for admission
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Rolling one-minute request budget (0 disables the window)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Wait time when rate limited without a Retry-After header (in seconds)
    #[serde(default = "default_rate_limit_wait")]
    pub rate_limit_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            max_concurrent: default_max_concurrent(),
            max_queue: default_max_queue(),
            requests_per_minute: default_requests_per_minute(),
            rate_limit_wait_secs: default_rate_limit_wait(),
        }
    }
}

fn default_min_interval() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_queue() -> usize {
    100
}

fn default_requests_per_minute() -> u32 {
    200
}

fn default_rate_limit_wait() -> u64 {
    60
}

/// Pagination ceilings applied to every bulk fetch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaginationConfig {
    /// Maximum pages fetched per entity
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Maximum records kept per entity
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Wall-clock ceiling for one entity fetch in seconds
    #[serde(default = "default_pagination_timeout")]
    pub timeout_secs: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_records: default_max_records(),
            timeout_secs: default_pagination_timeout(),
        }
    }
}

fn default_max_pages() -> usize {
    50
}

fn default_max_records() -> usize {
    10_000
}

fn default_pagination_timeout() -> u64 {
    600
}

/// Credential vault configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VaultConfig {
    /// Master key used to derive per-secret encryption keys
    #[serde(default)]
    pub master_key: Option<String>,
}

/// Validation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// TTL in the development posture (seconds)
    #[serde(default = "default_ttl_development")]
    pub ttl_development_secs: u64,

    /// TTL in the production posture (seconds)
    #[serde(default = "default_ttl_production")]
    pub ttl_production_secs: u64,

    /// Interval of the expired-entry sweep (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_development_secs: default_ttl_development(),
            ttl_production_secs: default_ttl_production(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_ttl_development() -> u64 {
    60
}

fn default_ttl_production() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "sienge-sync.db".to_string()
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "sienge-sync".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax. Unset variables are left untouched.
fn expand_env_vars(input: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
