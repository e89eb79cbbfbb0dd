use std::time::Duration;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after `failures` consecutive failures: `base * 2^(failures-1)`,
    /// capped at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u64.saturating_pow(failures - 1);
        let delay = self
            .base
            .saturating_mul(u32::try_from(multiplier).unwrap_or(u32::MAX));
        std::cmp::min(delay, self.max)
    }
}
