//! Reconnect delay schedule.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Exponential reconnect schedule: `min(max_delay, min_delay * 2^(attempt-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of random delay added per attempt. Zero keeps the schedule
    /// deterministic.
    pub jitter: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            jitter: Duration::ZERO,
        }
    }
}

impl ReconnectBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(20);
        let cap = self.max_delay.max(self.min_delay);
        self.min_delay.saturating_mul(1_u32 << exponent).min(cap)
    }

    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
