//! Configuration management for Ratekeeper.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatekeeperError, Result};

/// Prefix of environment variables overriding file settings, e.g.
/// `RATEKEEPER__BACKEND__KIND=redis_gcra`.
const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Limiter behavior shared by all backends
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The algorithm/store combination a limiter runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process GCRA
    #[default]
    Local,
    /// GCRA with state in Redis
    RedisGcra,
    /// Sliding-window log in Redis
    RedisSlidingWindow,
}

/// Backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis connection URL, required by the Redis backends
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix prepended to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratekeeper:".to_string()
}

/// Limiter behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Fixed burst for every call; defaults to each call's rate
    #[serde(default)]
    pub burst: Option<u64>,

    /// Deadline for one call in milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Emit a tracing event per call with its duration
    #[serde(default)]
    pub timing_events: bool,
}

impl LimiterSettings {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
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

impl RatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig =
            serde_yaml::from_str(yaml).map_err(|e| RatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional file under `RATEKEEPER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: RatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        match self.backend.kind {
            BackendKind::Local => Ok(()),
            BackendKind::RedisGcra | BackendKind::RedisSlidingWindow => {
                match self.backend.redis_url.as_deref() {
                    Some(url) if !url.is_empty() => Ok(()),
                    _ => Err(RatekeeperError::Config(format!(
                        "backend {:?} requires redis_url",
                        self.backend.kind
                    ))),
                }
            }
        }
    }
}
