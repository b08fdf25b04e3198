use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff and budget for reports that failed on something transient.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failure.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
    /// Deferred cycles a report gets before the next failure archives it.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Time a report waits in deferred after its `failed_attempts`-th failure.
    pub fn retry_interval(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }

    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts > self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: Duration,
    maximum_interval: Option<Duration>,
    max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts;
        self
    }

    /// Provide a RetryPolicy according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, Duration::from_secs(2)).provide();
        let first_interval = retry_policy.retry_interval(1);
        let second_interval = retry_policy.retry_interval(2);
        let third_interval = retry_policy.retry_interval(3);

        assert_eq!(first_interval, Duration::from_secs(2));
        assert_eq!(second_interval, Duration::from_secs(2));
        assert_eq!(third_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(2))
            .maximum_interval(Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(60), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(8));
    }

    #[test]
    fn test_exhaustion() {
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(1))
            .max_attempts(3)
            .provide();

        assert!(!retry_policy.is_exhausted(1));
        assert!(!retry_policy.is_exhausted(3));
        assert!(retry_policy.is_exhausted(4));
    }
}
