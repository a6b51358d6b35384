use rand::Rng;
use std::time::Duration;

use recepta_core::constants::{RETRY_BASE_DELAY_MS, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_MS};

/// Jittered exponential backoff for transmitter calls: attempt `n` sleeps
/// around `base * 2^(n-1)`, equal-jittered, capped.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after failed attempt `attempt` (1-based).
    /// Equal jitter: uniformly drawn from [half, full] of the exponential
    /// delay so synchronized retries spread out.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let half = capped / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=capped - half)
    }
}
