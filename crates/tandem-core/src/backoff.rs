//! Exponential retry backoff.
//!
//! `delay(n) = min(2^n * base, cap)`, saturating on overflow. The policy is a
//! pure function of the attempt number so it can be evaluated anywhere.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default base delay (1 second).
pub const DEFAULT_BASE_MS: u64 = 1_000;

/// Default upper bound (5 minutes).
pub const DEFAULT_CAP_MS: u64 = 300_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    /// Delay in milliseconds before retry number `attempt`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    /// Absolute time (epoch ms) of the next attempt.
    pub fn next_retry_at(&self, now: u64, attempt: u32) -> u64 {
        now.saturating_add(self.delay_ms(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_MS, DEFAULT_CAP_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let policy = BackoffPolicy::new(1_000, 10_000);
        assert_eq!(policy.delay_ms(0), 1_000);
        assert_eq!(policy.delay_ms(1), 2_000);
        assert_eq!(policy.delay_ms(3), 8_000);
        assert_eq!(policy.delay_ms(4), 10_000);
        assert_eq!(policy.delay_ms(60), 10_000);
    }

    #[test]
    fn test_huge_attempts_saturate() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_ms(64), DEFAULT_CAP_MS);
        assert_eq!(policy.delay_ms(u32::MAX), DEFAULT_CAP_MS);
    }

    #[test]
    fn test_next_retry_at() {
        let policy = BackoffPolicy::new(100, 1_000);
        assert_eq!(policy.next_retry_at(5_000, 2), 5_400);
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }
}
