//! Exponential backoff for reconnect attempts.
//!
//! ```text
//! attempt   delay (initial=200ms, max=10s)
//! ─────────────────────────────────────────
//!    0         200ms
//!    1         400ms
//!    2         800ms
//!   ...
//!    6+        10s (capped)
//! ```

use std::time::Duration;

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Stateful backoff: grows on each failure, resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait now; the next call returns a longer one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
