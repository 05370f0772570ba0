//! # Truncate Configuration
//!
//! Tunables for batching, concurrency limits, cascade polling and retry behaviour.
//!
//! Configuration is layered: built-in defaults, then an optional file
//! (TOML, YAML or JSON, detected by extension), then `TRUNCATE__*` environment
//! variables (double underscore separates nested keys, e.g.
//! `TRUNCATE__RETRY__MAX_ATTEMPTS=8`).
//!
//! ```rust,no_run
//! use truncate_core::config::TruncateConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TruncateConfig::load(Some(std::path::Path::new("truncate.toml")))?;
//! println!("batch size: {}", config.batch_size);
//! # Ok(())
//! # }
//! ```

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry policy for transient storage failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per storage call, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncateConfig {
    /// Row count hint passed to every delete batch
    pub batch_size: u64,
    /// Upper bound on delete batches in flight across the whole forest
    pub max_in_flight_batches: usize,
    /// Upper bound on concurrent count queries
    pub max_concurrent_counts: usize,
    /// How often cascade-deleted tables are re-measured
    pub cascade_poll_interval_ms: u64,
    /// Unchanged polls tolerated after the cascading owner finished
    pub cascade_settle_polls: u32,
    /// Capacity of the coordinator event channel
    pub event_channel_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for TruncateConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_in_flight_batches: 8,
            max_concurrent_counts: 8,
            cascade_poll_interval_ms: 1_000,
            cascade_settle_polls: 5,
            event_channel_capacity: 1_024,
            retry: RetryConfig::default(),
        }
    }
}

impl TruncateConfig {
    /// Configuration tuned for tests: tiny delays, small batches
    pub fn for_testing() -> Self {
        Self {
            batch_size: 7,
            max_in_flight_batches: 4,
            max_concurrent_counts: 4,
            cascade_poll_interval_ms: 5,
            cascade_settle_polls: 3,
            event_channel_capacity: 8_192,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
        }
    }

    pub fn cascade_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cascade_poll_interval_ms)
    }

    /// Defaults with `TRUNCATE_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(batch_size) = std::env::var("TRUNCATE_BATCH_SIZE") {
            config.batch_size = batch_size.parse().map_err(|e| {
                ConfigError::invalid_value("batch_size", format!("{batch_size}: {e}"))
            })?;
        }

        if let Ok(limit) = std::env::var("TRUNCATE_MAX_IN_FLIGHT_BATCHES") {
            config.max_in_flight_batches = limit.parse().map_err(|e| {
                ConfigError::invalid_value("max_in_flight_batches", format!("{limit}: {e}"))
            })?;
        }

        if let Ok(attempts) = std::env::var("TRUNCATE_RETRY_LIMIT") {
            config.retry.max_attempts = attempts.parse().map_err(|e| {
                ConfigError::invalid_value("retry.max_attempts", format!("{attempts}: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional config file and `TRUNCATE__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Self::default()).map_err(load_error)?;
        let mut builder = ::config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix("TRUNCATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(load_error)?
            .try_deserialize()
            .map_err(load_error)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be greater than zero").into());
        }
        if self.max_in_flight_batches == 0 {
            return Err(ConfigError::invalid_value(
                "max_in_flight_batches",
                "must be greater than zero",
            )
            .into());
        }
        if self.max_concurrent_counts == 0 {
            return Err(ConfigError::invalid_value(
                "max_concurrent_counts",
                "must be greater than zero",
            )
            .into());
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "event_channel_capacity",
                "must be greater than zero",
            )
            .into());
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "retry.max_attempts",
                "at least one attempt is required",
            )
            .into());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid_value(
                "retry.backoff_multiplier",
                "must be at least 1.0",
            )
            .into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid_value(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            )
            .into());
        }
        Ok(())
    }
}

fn load_error(e: ::config::ConfigError) -> ConfigError {
    ConfigError::Load {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TruncateError;

    #[test]
    fn test_defaults_are_valid() {
        let config = TruncateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cascade_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = TruncateConfig {
            max_in_flight_batches: 0,
            ..TruncateConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            TruncateError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "max_in_flight_batches"
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = TruncateConfig::default();
        config.retry.base_delay_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_testing_profile_is_valid() {
        assert!(TruncateConfig::for_testing().validate().is_ok());
    }
}
