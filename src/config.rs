//! Configuration management for Tollgate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{FailurePolicy, RateLimiterConfig, UpdateStrategy};

/// Prefix of environment variables overriding file settings.
///
/// Nested keys are separated by `__`, e.g.
/// `TOLLGATE__RATE_LIMITING__MAX_TOKENS=50`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Which store keeps bucket state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process memory; only for a single instance
    #[default]
    Memory,
    /// Redis shared by every instance
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound for a single store round trip in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout() -> u64 {
    250
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Bucket capacity
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,

    /// Expiry of idle bucket state in milliseconds
    #[serde(default = "default_state_ttl")]
    pub state_ttl_ms: u64,

    /// Identity claim names, most preferred first
    #[serde(default = "default_identity_claims")]
    pub identity_claims: Vec<String>,

    /// Prefix prepended to partition keys in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Answer given when the store cannot be consulted
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Concurrency protocol for bucket updates
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate_per_second: default_refill_rate(),
            state_ttl_ms: default_state_ttl(),
            identity_claims: default_identity_claims(),
            key_prefix: default_key_prefix(),
            failure_policy: FailurePolicy::default(),
            update_strategy: UpdateStrategy::default(),
        }
    }
}

fn default_max_tokens() -> f64 {
    20.0
}

fn default_refill_rate() -> f64 {
    20.0
}

fn default_state_ttl() -> u64 {
    5000
}

fn default_identity_claims() -> Vec<String> {
    vec!["sub".to_string(), "UserId".to_string()]
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, overridden by `TOLLGATE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("rate_limiting.identity_claims")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(format!("Failed to load configuration: {}", e)))
    }

    /// Build the validated limiter configuration.
    pub fn limiter_config(&self) -> Result<RateLimiterConfig> {
        let rl = &self.rate_limiting;
        let config = RateLimiterConfig::new(rl.max_tokens, rl.refill_rate_per_second)
            .with_state_ttl(Duration::from_millis(rl.state_ttl_ms))
            .with_store_timeout(Duration::from_millis(self.store.timeout_ms))
            .with_identity_claims(rl.identity_claims.clone())
            .with_key_prefix(rl.key_prefix.clone())
            .with_failure_policy(rl.failure_policy)
            .with_update_strategy(rl.update_strategy);

        config.validate()?;
        Ok(config)
    }
}
