use std::time;

use rand::Rng;

#[derive(Copy, Clone, Debug)]
/// The retry policy a provider client uses to space out retries of transient
/// provider failures.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total attempts per logical request, including the first one.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Calculate the backoff before retry number `attempt` (zero-based).
    /// Jittered to half-to-full of the exponential candidate so that
    /// concurrent requests against a struggling provider do not retry in
    /// lockstep.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        let capped_interval = match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        };

        if capped_interval.is_zero() {
            return capped_interval;
        }

        let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
        capped_interval.mul_f64(jitter_factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: Some(time::Duration::from_secs(5)),
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_grow_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy::new(2, time::Duration::from_millis(100), None, 3);

        for attempt in 0..4 {
            let expected_ceiling = time::Duration::from_millis(100 * 2u64.pow(attempt));
            let interval = policy.retry_interval(attempt);
            assert!(interval <= expected_ceiling);
            assert!(interval >= expected_ceiling / 2);
        }
    }

    #[test]
    fn intervals_respect_the_maximum() {
        let policy = RetryPolicy::new(
            4,
            time::Duration::from_millis(500),
            Some(time::Duration::from_secs(2)),
            5,
        );

        for attempt in 0..10 {
            assert!(policy.retry_interval(attempt) <= time::Duration::from_secs(2));
        }
    }

    #[test]
    fn at_least_one_attempt_is_always_allowed() {
        let policy = RetryPolicy::new(2, time::Duration::from_millis(100), None, 0);
        assert_eq!(policy.max_attempts(), 1);
    }
}
