//! Bounded exponential backoff for transient storage failures.

use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: RetryConfig,
}

impl BackoffCalculator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.config.max_attempts
    }

    /// Delay before the retry following failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.config.backoff_multiplier.powi(exponent);
        let millis = (self.config.base_delay_ms as f64 * factor).min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}
