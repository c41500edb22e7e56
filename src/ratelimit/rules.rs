//! Named rate limit policies.
//!
//! Request handlers refer to limits by action name (`login`, `verify`,
//! `comment`, ...) rather than hard-coding numbers. Policies are loaded from
//! YAML in the same shape Envoy uses for its rate limit rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewellError, Result};

/// Default number of requests when no policy matches.
const DEFAULT_REQUESTS_PER_UNIT: u64 = 100;
/// Default time unit when no policy matches.
const DEFAULT_UNIT: TimeUnit = TimeUnit::Minute;

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests allowed per window
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in units, e.g. 15 with `minute` for a 15 minute window
    #[serde(default = "default_unit_multiplier")]
    pub unit_multiplier: u64,
}

fn default_unit_multiplier() -> u64 {
    1
}

impl RateLimitRule {
    pub fn new(requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            requests_per_unit,
            unit,
            unit_multiplier: 1,
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        let unit_ms = self.unit.duration().as_millis() as u64;
        unit_ms.saturating_mul(self.unit_multiplier.max(1))
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_UNIT, DEFAULT_UNIT)
    }
}

/// A set of named policies with a fallback rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Rule applied to actions without their own entry
    #[serde(default)]
    pub default: RateLimitRule,
    /// Map of action name to rule
    #[serde(default)]
    pub rules: HashMap<String, RateLimitRule>,
}

impl PolicySet {
    /// Create a policy set with only the default rule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for `name`.
    pub fn with_rule(mut self, name: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(name.into(), rule);
        self
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatewellError::Config(format!("Failed to parse rate limit policies: {}", e)))
    }

    /// The rule configured for `name`, if any.
    pub fn find(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.get(name)
    }

    /// The rule for `name`, falling back to the default rule.
    pub fn resolve(&self, name: &str) -> &RateLimitRule {
        self.find(name).unwrap_or(&self.default)
    }
}
