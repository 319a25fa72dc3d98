//! Configuration management for Gatekeeper.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::{duration_millis, MAX_EXPIRY};
use crate::error::{GatekeeperError, Result};
use crate::lock::{LockOptions, DEFAULT_LEASE, DEFAULT_RETRY_INTERVAL};
use crate::ratelimit::RateLimiterConfig;
use crate::store::DEFAULT_RESPONSE_TIMEOUT;

/// Prefix for environment overrides, e.g. `GATEKEEPER_STORE__URL`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Named rate limiter definitions
    #[serde(default)]
    pub rate_limiters: Vec<RateLimiterConfig>,
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// How long a script call waits for its reply, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64
}

/// Lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease applied on every acquire, in milliseconds
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Delay between acquisition attempts, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_lease_ms() -> u64 {
    DEFAULT_LEASE.as_millis() as u64
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL.as_millis() as u64
}

impl LockConfig {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            lease: Duration::from_millis(self.lease_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply `GATEKEEPER_*`
    /// environment overrides. Nested keys are separated by `__`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section; limiter names must be unique.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(GatekeeperError::Config("store url must not be empty".into()));
        }
        if self.store.response_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "store response_timeout_ms must be positive".into(),
            ));
        }
        if self.lock.lease_ms == 0 {
            return Err(GatekeeperError::Config("lock lease_ms must be positive".into()));
        }
        if self.lock.options().lease > MAX_EXPIRY {
            return Err(GatekeeperError::Config(format!(
                "lock lease_ms must not exceed {}",
                duration_millis(MAX_EXPIRY)
            )));
        }

        let mut seen = HashSet::new();
        for limiter in &self.rate_limiters {
            limiter.validate()?;
            if !seen.insert(limiter.name.as_str()) {
                return Err(GatekeeperError::Config(format!(
                    "duplicate rate limiter '{}'",
                    limiter.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.lock.options(), LockOptions::default());
        assert!(config.rate_limiters.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  url: redis://cache:6379/2
  response_timeout_ms: 250
lock:
  lease_ms: 10000
  retry_interval_ms: 50
rate_limiters:
  - name: api
    capacity: 5
    refresh_period_ms: 5000
    algorithm: sliding_window
  - name: login
    capacity: 3
    refresh_period_ms: 60000
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.url, "redis://cache:6379/2");
        assert_eq!(config.store.response_timeout(), Duration::from_millis(250));
        assert_eq!(config.lock.options().lease, Duration::from_secs(10));
        assert_eq!(config.lock.options().retry_interval, Duration::from_millis(50));
        assert_eq!(config.rate_limiters.len(), 2);
        assert_eq!(config.rate_limiters[0].algorithm, Algorithm::SlidingWindow);
        assert_eq!(config.rate_limiters[1].algorithm, Algorithm::FixedWindow);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = GatekeeperConfig::from_yaml("lock:\n  lease_ms: 5000\n").unwrap();
        assert_eq!(config.store, StoreConfig::default());
        assert_eq!(config.lock.lease_ms, 5000);
        assert_eq!(config.lock.retry_interval_ms, 100);
    }

    #[test]
    fn test_invalid_limiter_rejected() {
        let yaml = r#"
rate_limiters:
  - name: api
    capacity: 0
    refresh_period_ms: 5000
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_limiter_rejected() {
        let yaml = r#"
rate_limiters:
  - name: api
    capacity: 1
    refresh_period_ms: 1000
  - name: api
    capacity: 2
    refresh_period_ms: 1000
"#;
        let err = GatekeeperConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_oversized_values_rejected() {
        let lease = GatekeeperConfig::from_yaml("lock:\n  lease_ms: 18446744073709551615\n");
        assert!(matches!(lease, Err(GatekeeperError::Config(_))));

        let period = r#"
rate_limiters:
  - name: api
    capacity: 1
    refresh_period_ms: 18446744073709551615
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(period),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(GatekeeperConfig::from_yaml("lock: [").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "store:\n  url: redis://from-file:6379\nrate_limiters:\n  - name: api\n    capacity: 2\n    refresh_period_ms: 1000"
        )
        .unwrap();

        let config = GatekeeperConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.store.url, "redis://from-file:6379");
        assert_eq!(config.rate_limiters[0].capacity, 2);

        let same = GatekeeperConfig::from_file(file.path()).unwrap();
        assert_eq!(same, config);
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let result = GatekeeperConfig::from_file("/nonexistent/gatekeeper.yaml");
        assert!(matches!(result, Err(GatekeeperError::Io(_))));
    }
}
