use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy the sink controller follows when a delivery or an offset
/// commit fails transiently.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
    /// How many retries a single batch gets before the partition halts.
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_retries,
        }
    }

    /// Calculate the time to wait before retry number `attempt + 1`.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        std::cmp::min(candidate_interval, self.maximum_interval)
    }

    /// Whether a batch that already went through `attempt` retries may be tried again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn maximum_interval(&self) -> time::Duration {
        self.maximum_interval
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(500),
            maximum_interval: time::Duration::from_secs(30),
            max_retries: 5,
        }
    }
}
