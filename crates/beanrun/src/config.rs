//! # Runtime Configuration
//!
//! Deployment-time settings that are not part of a component's code: the
//! dispatcher's retry policy, the remote call timeout, and per-component pool
//! overrides. Loaded from TOML; every field has a default.
//!
//! ```toml
//! [logging]
//! level = "beanrun=debug"
//!
//! [dispatch]
//! max_attempts = 20
//! interval_ms = 50
//!
//! [remote]
//! call_timeout_ms = 5000
//!
//! [components.calculator]
//! max = 4
//! timeout_ms = 500
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::RetryPolicy;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Config I/O error: {}", e),
            Self::Parse(e) => write!(f, "Config parse error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
    pub remote: RemoteConfig,
    pub components: HashMap<String, ComponentOverrides>,
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn overrides(&self, component: &str) -> Option<&ComponentOverrides> {
        self.components.get(component)
    }
}

/// Default filter directive, used when `BEANRUN_LOG` is unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

/// How long the dispatcher keeps polling a container that is still starting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub backoff: f64,
    pub max_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            interval_ms: policy.interval.as_millis() as u64,
            backoff: policy.backoff,
            max_interval_ms: policy.max_interval.as_millis() as u64,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_millis(self.interval_ms),
            backoff: self.backoff,
            max_interval: Duration::from_millis(self.max_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub call_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { call_timeout_ms: 30_000 }
    }
}

impl RemoteConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Pool settings that replace the ones compiled into a descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComponentOverrides {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub spare: Option<usize>,
    pub max_waiters: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}
