use std::time::Duration;

use rand::Rng;

/// How long to wait between connection attempts to the same node.
///
/// Delays double from `initial_delay` up to `max_delay`, and each one is scaled by a random factor
/// in `[1 - random_factor, 1 + random_factor]`, then capped at `max_delay`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub random_factor: f64,
    /// Connection attempts made after the first one failed, before giving up
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            random_factor: 0.2,
            max_retries: 5,
        }
    }

    pub fn with_random_factor(mut self, random_factor: f64) -> Self {
        self.random_factor = random_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// True if another attempt may follow `retries` failed retries
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// The delay before retry number `retry`, counting from zero
    pub fn delay(&self, retry: u32) -> Duration {
        let exponential = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.random_factor <= 0.0 {
            return exponential;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.random_factor..=1.0 + self.random_factor);
        exponential.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_maximum() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)).with_random_factor(0.0);
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(64), Duration::from_millis(40));
    }

    #[quickcheck]
    fn jittered_delays_stay_within_bounds(retry: u8) -> bool {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)).with_random_factor(0.5);
        let exponential = policy.initial_delay.saturating_mul(2u32.saturating_pow(retry.into()));
        let delay = policy.delay(retry.into());
        delay <= policy.max_delay && delay >= exponential.min(policy.max_delay).mul_f64(0.5)
    }

    #[test]
    fn retries_are_limited() {
        let policy = BackoffPolicy::default().with_max_retries(2);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
        assert!(!BackoffPolicy::default().with_max_retries(0).allows_retry(0));
    }
}
