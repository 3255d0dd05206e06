//! Configuration file loading and management
//!
//! This module handles loading and parsing the plugin configuration from
//! `$XDG_CONFIG_HOME/stratus/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::RetryPolicy;
use crate::executor::{ExecutorOptions, ScopeErrorPolicy};

/// Environment variable consulted when no token is configured inline.
pub const DEFAULT_TOKEN_ENV: &str = "STRATUS_ACCESS_TOKEN";

/// Main plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Plugin server configuration
    #[serde(default)]
    pub plugin: PluginConfig,
    /// Provider connection settings
    pub connection: ConnectionConfig,
    /// Scan execution tuning
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Retry behaviour for throttled and transient calls
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Plugin server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginConfig {
    /// Bind address for the JSON-RPC server
    /// Default: "127.0.0.1:7171"
    pub bind_address: String,
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

/// Provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Base URL of the provider API
    pub endpoint: String,
    /// Inline access token (prefer `access_token_env`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Environment variable holding the access token
    /// Default: "STRATUS_ACCESS_TOKEN"
    #[serde(default = "default_token_env")]
    pub access_token_env: String,
    /// Regions to fan out over
    pub regions: Vec<String>,
    /// Per-call timeout in seconds
    /// Default: 30
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Scan execution tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// What a failing scope does to the rest of the scan
    /// Default: "partial_success"
    pub scope_error_policy: ScopeErrorPolicy,
    /// Maximum number of scopes scanned at once
    /// Default: 8
    pub max_concurrent_scopes: usize,
    /// Maximum number of in-flight hydration calls per page
    /// Default: 4
    pub hydrate_workers: usize,
    /// Page size requested from the provider
    /// Default: 100
    pub page_size: u32,
    /// Rows buffered between scope tasks and the consumer
    /// Default: 256
    pub channel_capacity: usize,
}

/// Retry behaviour for throttled and transient calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    /// Default: 5
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds
    /// Default: 200
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    /// Default: 10000
    pub max_delay_ms: u64,
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin: PluginConfig::default(),
            connection: ConnectionConfig::default(),
            execution: ExecutionConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7171".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.compute.example.com".to_string(),
            access_token: None,
            access_token_env: default_token_env(),
            regions: vec!["region-1".to_string()],
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            scope_error_policy: ScopeErrorPolicy::PartialSuccess,
            max_concurrent_scopes: 8,
            hydrate_workers: 4,
            page_size: 100,
            channel_capacity: 256,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/stratus/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "stratus-labs", "stratus")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        r#"# Stratus Plugin Configuration

[plugin]
# Bind address for the JSON-RPC server the host connects to
bind_address = "127.0.0.1:7171"

# Log level: trace, debug, info, warn, error (RUST_LOG overrides this)
log_level = "info"

[connection]
# Base URL of the provider API
endpoint = "https://api.compute.example.com"

# The access token is read from this environment variable.
# An inline `access_token = "..."` takes precedence when set.
access_token_env = "STRATUS_ACCESS_TOKEN"

# Regions scanned by region-partitioned tables
regions = ["region-1"]

# Per-call timeout in seconds
request_timeout_secs = 30

[execution]
# "partial_success": a failing region is reported in the scan summary and
#                    the other regions keep streaming.
# "fail_fast":       the first failing region aborts the whole scan.
scope_error_policy = "partial_success"

# Regions scanned at once
max_concurrent_scopes = 8

# In-flight detail calls per page for tables with hydrated columns
hydrate_workers = 4

# Page size requested from the provider
page_size = 100

# Rows buffered between region tasks and the host
channel_capacity = 256

[retry]
# Attempts per call (including the first) for throttled or transient errors
max_attempts = 5
base_delay_ms = 200
max_delay_ms = 10000
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.plugin
            .bind_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind_address: {}", self.plugin.bind_address))?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.plugin.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.plugin.log_level,
                valid_log_levels.join(", ")
            );
        }

        url::Url::parse(&self.connection.endpoint)
            .with_context(|| format!("Invalid endpoint: {}", self.connection.endpoint))?;

        if self.connection.regions.is_empty() {
            anyhow::bail!("connection.regions must list at least one region");
        }
        if self.connection.regions.iter().any(|r| r.trim().is_empty()) {
            anyhow::bail!("connection.regions must not contain empty names");
        }
        if self.connection.request_timeout_secs == 0 {
            anyhow::bail!("connection.request_timeout_secs must be greater than 0");
        }

        if self.execution.max_concurrent_scopes == 0 {
            anyhow::bail!("execution.max_concurrent_scopes must be greater than 0");
        }
        if self.execution.hydrate_workers == 0 {
            anyhow::bail!("execution.hydrate_workers must be greater than 0");
        }
        if self.execution.page_size == 0 {
            anyhow::bail!("execution.page_size must be greater than 0");
        }
        if self.execution.channel_capacity == 0 {
            anyhow::bail!("execution.channel_capacity must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }

        Ok(())
    }

    /// Resolve the access token: inline value first, then the environment.
    pub fn access_token(&self) -> Result<String> {
        if let Some(ref token) = self.connection.access_token {
            return Ok(token.clone());
        }

        std::env::var(&self.connection.access_token_env).with_context(|| {
            format!(
                "No access token configured and ${} is not set",
                self.connection.access_token_env
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            regions: self.connection.regions.clone(),
            scope_error_policy: self.execution.scope_error_policy,
            max_concurrent_scopes: self.execution.max_concurrent_scopes,
            hydrate_workers: self.execution.hydrate_workers,
            page_size: self.execution.page_size,
            channel_capacity: self.execution.channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.plugin.bind_address, "127.0.0.1:7171");
        assert_eq!(config.plugin.log_level, "info");
        assert_eq!(config.connection.regions, vec!["region-1"]);
        assert_eq!(
            config.execution.scope_error_policy,
            ScopeErrorPolicy::PartialSuccess
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_content_parses() {
        let config: Config = toml::from_str(&Config::default_config_content()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[plugin]
bind_address = "0.0.0.0:9000"
log_level = "debug"

[connection]
endpoint = "http://localhost:8080"
access_token = "secret"
regions = ["region-1", "region-2"]

[execution]
scope_error_policy = "fail_fast"
max_concurrent_scopes = 2
hydrate_workers = 1
page_size = 10
channel_capacity = 16
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.plugin.bind_address, "0.0.0.0:9000");
        assert_eq!(config.connection.regions.len(), 2);
        assert_eq!(config.connection.request_timeout_secs, 30);
        assert_eq!(config.execution.scope_error_policy, ScopeErrorPolicy::FailFast);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.access_token().unwrap(), "secret");

        let options = config.executor_options();
        assert_eq!(options.regions, vec!["region-1", "region-2"]);
        assert_eq!(options.hydrate_workers, 1);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config_content = r#"
[connection]
endpoint = "http://localhost:8080"
regions = ["region-1"]

[execution]
page_size = 25

[retry]
max_attempts = 7
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.plugin, PluginConfig::default());
        assert_eq!(config.execution.page_size, 25);
        assert_eq!(config.execution.max_concurrent_scopes, 8);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.retry.max_delay_ms, 10_000);
    }

    #[test]
    fn test_load_rejects_unknown_policy() {
        let config_content = r#"
[plugin]
bind_address = "127.0.0.1:7171"
log_level = "info"

[connection]
endpoint = "http://localhost:8080"
regions = ["region-1"]

[execution]
scope_error_policy = "best_effort"
max_concurrent_scopes = 2
hydrate_workers = 1
page_size = 10
channel_capacity = 16
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();
        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_validate_invalid_bind_address() {
        let mut config = Config::default();
        config.plugin.bind_address = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.plugin.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_endpoint() {
        let mut config = Config::default();
        config.connection.endpoint = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_regions() {
        let mut config = Config::default();
        config.connection.regions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = Config::default();
        config.execution.hydrate_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_retry_bounds() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.base_delay_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_access_token_from_env() {
        let mut config = Config::default();
        config.connection.access_token_env = "STRATUS_TEST_TOKEN_FROM_ENV".to_string();
        assert!(config.access_token().is_err());

        std::env::set_var("STRATUS_TEST_TOKEN_FROM_ENV", "from-env");
        assert_eq!(config.access_token().unwrap(), "from-env");
        std::env::remove_var("STRATUS_TEST_TOKEN_FROM_ENV");
    }

    #[test]
    fn test_retry_policy_conversion() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_full_config_roundtrip() {
        let mut config = Config::default();
        config.plugin.log_level = "debug".to_string();
        config.connection.regions.push("region-2".to_string());

        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
    }
}
