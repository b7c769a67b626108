//! Bounded exponential backoff.

use std::time::Duration;

use crate::config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_max: backoff_max.max(backoff_base),
        }
    }

    /// Policy used for broker publishes.
    pub fn for_publish(broker: &BrokerConfig) -> Self {
        Self::new(
            broker.publish_max_attempts,
            Duration::from_millis(broker.publish_initial_backoff_ms),
            Duration::from_millis(broker.publish_max_backoff_ms),
        )
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Doubles from `backoff_base` and saturates at `backoff_max`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |delay| delay.min(self.backoff_max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}
