//! Retry backoff: bounded exponential with jitter.

use rand::Rng;
use std::time::Duration;

/// Retry policy for transient send failures.
///
/// Delay for attempt `k` (zero-based) is `min(base * 2^k + jitter, max_delay)`
/// with jitter of up to +25%. Jitter only stretches the delay, so the first
/// retry never lands before one full base delay, and because the exponential
/// doubles while the jitter band is only a quarter wide, successive delays
/// are non-decreasing up to the cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

/// Production baseline: first retry after about a minute.
pub const PRODUCTION_BASE: Duration = Duration::from_secs(60);
/// Test baseline, so integration scenarios observe a retry within seconds.
pub const TEST_BASE: Duration = Duration::from_secs(1);
/// Upper bound on any single delay.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: PRODUCTION_BASE,
            max_delay: MAX_DELAY,
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS as u32,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (zero-based: the delay scheduled
    /// after the first failed attempt is `delay_for_attempt(0)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .as_millis()
            .saturating_mul(1u128 << attempt.min(20))
            .min(self.max_delay.as_millis());

        let jitter_band = exp / 4;
        let jittered = if jitter_band == 0 {
            exp
        } else {
            exp + rand::thread_rng().gen_range(0..=jitter_band)
        };

        Duration::from_millis(jittered.min(self.max_delay.as_millis()) as u64)
    }

    /// Whether another attempt may be scheduled after `attempts_made`
    /// attempts have completed.
    pub fn has_budget(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_band() {
        let policy = RetryPolicy::new(Duration::from_secs(1), MAX_DELAY, 5);
        for _ in 0..100 {
            let d = policy.delay_for_attempt(0).as_millis();
            assert!(
                (1000..=1250).contains(&d),
                "delay {} outside [base, base * 1.25]",
                d
            );
        }
    }

    #[test]
    fn delays_are_monotonic_until_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(60), MAX_DELAY, 10);
        for _ in 0..50 {
            let mut prev = Duration::ZERO;
            for attempt in 0..8 {
                let d = policy.delay_for_attempt(attempt);
                assert!(
                    d >= prev,
                    "attempt {} delay {:?} < previous {:?}",
                    attempt,
                    d,
                    prev
                );
                prev = d;
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(60), MAX_DELAY, 10);
        // 60s * 2^10 is far beyond the cap.
        let d = policy.delay_for_attempt(10);
        assert!(d <= MAX_DELAY);
    }

    #[test]
    fn budget_counts_attempts_made() {
        let policy = RetryPolicy::new(TEST_BASE, MAX_DELAY, 5);
        assert!(policy.has_budget(0));
        assert!(policy.has_budget(4));
        assert!(!policy.has_budget(5));
    }
}
