//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Collections synchronized by each cycle, in order.
    pub collections: Vec<String>,
    /// Page size for incremental pulls.
    pub pull_batch_size: u32,
    /// Maximum pending records pushed per cycle (0 = unbounded).
    pub push_batch_size: u32,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Timeout applied to each remote call by the client implementation.
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given collections.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
            pull_batch_size: 100,
            push_batch_size: 0,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the pull page size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch limit.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(["entities", "curations"])
    }
}

/// Deterministic exponential-backoff policy.
///
/// [`RetryConfig::delay_for_attempt`] is a pure function of the attempt
/// number, so retry schedules are testable without wall-clock waits.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per subsequent attempt.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry policy with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Returns the delay preceding the given attempt (0-indexed).
    ///
    /// The first attempt is immediate; later attempts back off exponentially
    /// up to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = SyncConfig::new(["entities"])
            .with_pull_batch_size(25)
            .with_push_batch_size(10)
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.collections, vec!["entities"]);
        assert_eq!(config.pull_batch_size, 25);
        assert_eq!(config.push_batch_size, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn default_collections() {
        let config = SyncConfig::default();
        assert_eq!(config.collections, vec!["entities", "curations"]);
    }

    #[test]
    fn backoff_is_deterministic_and_exponential() {
        let retry = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_respects_max_delay() {
        let retry = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(4))
            .with_backoff_multiplier(10.0);

        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(4));
    }

    #[test]
    fn no_retry_budget() {
        let retry = RetryConfig::no_retry();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.delay_for_attempt(1), Duration::ZERO);
    }
}
