//! Retry policy: decides whether a failed job is retried and after which delay.

use std::time::Duration;

use rand::Rng;

use crate::domain::RetryConfig;

/// Retry policy for failed jobs.
///
/// Exponential backoff: `delay = min(base_delay * 2^(attempt - 1), max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total executions allowed, first one included.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Spread each delay uniformly over `[delay / 2, delay]`.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }

    /// May a job that just failed its `attempts`-th execution run again?
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Backoff after the `attempt`-th execution failed (1-indexed).
    ///
    /// Example with base_delay=1s, max_delay=30s:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    /// - attempt 6: 30s (capped)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Backoff with jitter applied when enabled.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let max_ms = delay.as_millis() as u64;
        let min_ms = max_ms / 2;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(!policy.jitter);
    }

    #[rstest]
    #[case::first(1, 1_000)]
    #[case::second(2, 2_000)]
    #[case::third(3, 4_000)]
    #[case::fifth(5, 16_000)]
    #[case::capped(6, 30_000)]
    #[case::far_out(200, 30_000)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn backoff_matches_formula_for_many_configs() {
        for base_ms in [1u64, 10, 250, 1_000] {
            for max_ms in [base_ms, base_ms * 3, 60_000] {
                let policy = RetryPolicy {
                    max_attempts: 10,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(max_ms),
                    jitter: false,
                };
                for k in 1..=12u32 {
                    let expected = (base_ms * 2u64.pow(k - 1)).min(max_ms);
                    assert_eq!(policy.backoff(k), Duration::from_millis(expected));
                }
            }
        }
    }

    #[rstest]
    #[case::first_failure(1, true)]
    #[case::second_failure(2, true)]
    #[case::exhausted(3, false)]
    #[case::beyond(4, false)]
    fn retries_until_max_attempts(#[case] attempts: u32, #[case] retry: bool) {
        assert_eq!(RetryPolicy::default().should_retry(attempts), retry);
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for attempt in 1..=6 {
            let full = policy.backoff(attempt);
            for _ in 0..50 {
                let d = policy.next_delay(attempt);
                assert!(d <= full);
                assert!(d >= full / 2);
            }
        }
    }
}
