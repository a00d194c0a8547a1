//! Reconnect backoff policy.

use std::time::Duration;

use deechat_mcp_config::RetryConfig;

/// Exponential backoff with jitter and a delay cap.
///
/// The delay for attempt `n` (zero-based) is
/// `min(initial_delay * backoff_factor^n, max_delay)` with ±25% jitter;
/// `delay` returns `None` once `max_retries` attempts are exhausted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts; 0 means never retry
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry attempt `attempt` (zero-based), or `None` once
    /// the attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let base = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64).max(0.0) as u64;

        // ±25% jitter to avoid thundering-herd reconnects.
        let jitter_range = capped / 4;
        let final_delay = if jitter_range > 0 {
            capped - jitter_range + fastrand::u64(0..=jitter_range * 2)
        } else {
            capped
        };
        Some(Duration::from_millis(final_delay))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }
}
