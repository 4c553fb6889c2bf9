//! Retry backoff policy.
//!
//! Exponential delay doubling per retry, jittered by up to ±50% so a
//! burst of failures does not re-enter the queue in lockstep, capped.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy for retry re-entry delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    /// Flat delay between bounded store-access attempts.
    pub fn base_delay(&self) -> Duration {
        self.base
    }

    /// Delay before the given retry (1-based) becomes visible again.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let raw = self
            .base
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .min(self.cap);
        // ±50% jitter
        let millis = raw.as_millis().max(1) as u64;
        let jittered = rand::thread_rng()
            .gen_range(millis / 2..=millis + millis / 2)
            .max(1);
        Duration::from_millis(jittered).min(self.cap)
    }
}
