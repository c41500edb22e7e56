//! Configuration management for Ratewell.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RatewellError, Result};
use crate::ratelimit::PolicySet;

/// Prefix for environment variable overrides, e.g. `RATEWELL__REMOTE__URL`.
const ENV_PREFIX: &str = "RATEWELL";

/// Main configuration for Ratewell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewellConfig {
    /// Remote counter store configuration
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Local counter store configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Circuit breaker for the remote store
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Named rate limit policies
    #[serde(default)]
    pub policies: PolicySet,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Redis URL; local-only operation when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix applied to every key stored remotely
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one remote check, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connection establishment timeout, in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Reconnection attempts made by the connection manager
    #[serde(default = "default_retries")]
    pub retries: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_connection_timeout_ms() -> u64 {
    100
}

fn default_retries() -> usize {
    1
}

/// Local counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Number of keys at which expired entries are swept
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Minimum time between those sweeps, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_max_entries() -> usize {
    10000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Whether repeated remote failures suspend remote calls
    #[serde(default)]
    pub enabled: bool,

    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long remote calls stay suspended, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatewellConfig {
    /// Load configuration from an optional YAML file plus `RATEWELL__*`
    /// environment overrides.
    ///
    /// The `config` crate lowercases map keys, so a YAML file's `policies`
    /// section is read again with `serde_yaml` to keep policy names as written.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let mut loaded: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RatewellError::Config(e.to_string()))?;

        if let Some(path) = path.filter(|path| is_yaml(path)) {
            if let Some(policies) = read_policies(path)? {
                loaded.policies = policies;
            }
        }

        Ok(loaded)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RatewellError::Config(e.to_string()))
    }
}

/// The `policies` section of a configuration file, ignoring everything else.
#[derive(Deserialize)]
struct PolicySection {
    #[serde(default)]
    policies: Option<PolicySet>,
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn read_policies(path: &Path) -> Result<Option<PolicySet>> {
    let contents = std::fs::read_to_string(path)?;
    let section: PolicySection = serde_yaml::from_str(&contents)
        .map_err(|e| RatewellError::Config(format!("Failed to parse rate limit policies: {}", e)))?;
    Ok(section.policies)
}
