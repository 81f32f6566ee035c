//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before a record is routed to failed.
    pub max_retry_count: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay (jitter included).
    pub max_delay: Duration,

    /// Symmetric jitter as a fraction of the delay (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Deterministic variant, mostly useful in tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Un-jittered delay for a record that has failed `attempt_count` times
    /// before the current failure.
    ///
    /// delay = base_delay * 2^attempt_count, capped at max_delay:
    /// - attempt_count 0: 2s
    /// - attempt_count 1: 4s
    /// - attempt_count 2: 8s
    pub fn base_delay_for(&self, attempt_count: u32) -> Duration {
        // 2^20 * base is far beyond any sane cap already
        let exponent = attempt_count.min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Delay with jitter applied, clamped to `[0, max_delay]`.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let delay = apply_jitter(self.base_delay_for(attempt_count), self.jitter_factor);
        delay.min(self.max_delay)
    }

    /// Would one more failure on top of `attempt_count` exhaust the budget?
    pub fn is_exhausted_after(&self, attempt_count: u32) -> bool {
        attempt_count.saturating_add(1) > self.max_retry_count
    }
}

/// Randomize `duration` by ±`jitter_factor` so records that failed together
/// do not come back together.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let factor = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * factor;
    let offset = rand::thread_rng().gen_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retry_count, 10);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 4)]
    #[case(2, 8)]
    #[case(3, 16)]
    #[case(7, 256)]
    #[case(8, 300)]
    #[case(30, 300)]
    fn exponential_backoff_is_capped(#[case] attempt_count: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.next_delay(attempt_count), Duration::from_secs(secs));
    }

    #[test]
    fn backoff_is_monotonic_up_to_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..40).map(|n| policy.base_delay_for(n)).collect();

        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays.last().copied(), Some(policy.max_delay));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..Default::default()
        };

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let delay = policy.next_delay(2); // 8s base
            assert!(delay >= Duration::from_secs(4), "too small: {delay:?}");
            assert!(delay <= Duration::from_secs(12), "too large: {delay:?}");
            seen.insert(delay.as_millis());
        }
        assert!(seen.len() > 1, "jitter should vary the delay");
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            jitter_factor: 1.0,
            ..Default::default()
        };
        for _ in 0..50 {
            assert!(policy.next_delay(20) <= policy.max_delay);
        }
    }

    #[rstest]
    #[case(2, 0, false)]
    #[case(2, 1, false)]
    #[case(2, 2, true)]
    #[case(0, 0, true)]
    fn exhaustion_counts_the_current_failure(
        #[case] max_retry_count: u32,
        #[case] attempt_count: u32,
        #[case] exhausted: bool,
    ) {
        let policy = RetryPolicy {
            max_retry_count,
            ..Default::default()
        };
        assert_eq!(policy.is_exhausted_after(attempt_count), exhausted);
    }
}
