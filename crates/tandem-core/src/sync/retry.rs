//! Exponential backoff.

use std::time::Duration;

/// Delay schedule `base * 2^attempt`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Schedule used between queue drains after consecutive transient failures
    pub const QUEUE: Self = Self::new(Duration::from_millis(500), Duration::from_secs(60));

    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::QUEUE
    }
}
