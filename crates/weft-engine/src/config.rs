//! Engine configuration, loadable from TOML with per-field defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker tasks draining the dispatch queue.
    pub workers: usize,
    /// Attempt budget for steps that do not set their own.
    pub default_max_attempts: u32,
    /// Timeout for steps that do not set their own.
    pub default_step_timeout_secs: u64,
    /// Timeout for a single compensation action attempt.
    pub compensation_timeout_secs: u64,
    /// Broadcast channel capacity for lifecycle events.
    pub event_capacity: usize,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_trials: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_attempts: 3,
            default_step_timeout_secs: 300,
            compensation_timeout_secs: 60,
            event_capacity: 1024,
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            jitter: 0.25,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            half_open_trials: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(
                "retry.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            half_open_trials: self.breaker.half_open_trials,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
