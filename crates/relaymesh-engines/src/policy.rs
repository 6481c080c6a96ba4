//! Reconnection policy for supervised processes

use std::time::Duration;

/// Bounded reconnect policy
///
/// With the default `multiplier` of 1.0 the backoff is fixed; raising it turns
/// the same policy into capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed before the tunnel is marked failed
    pub max_retries: u32,
    /// Delay before the first reconnect attempt
    pub initial_backoff: Duration,
    /// Backoff multiplier per attempt
    pub multiplier: f64,
    /// Upper bound for the computed backoff
    pub max_backoff: Duration,
    /// Reset the attempt counter once the process reports `connected`
    pub reset_on_connect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_secs(30),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(30),
            reset_on_connect: false,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed backoff policy
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            multiplier: 1.0,
            max_backoff: backoff,
            reset_on_connect: false,
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// once the attempt would exceed `max_retries`
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }

        if self.multiplier <= 1.0 {
            return Some(self.initial_backoff);
        }

        let factor = self.multiplier.powi(attempt as i32 - 1);
        let delay = self.initial_backoff.mul_f64(factor);

        Some(delay.min(self.max_backoff.max(self.initial_backoff)))
    }
}
