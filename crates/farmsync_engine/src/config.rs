//! Dispatcher configuration.

use std::time::Duration;

/// Configuration shared by every dispatcher in a pool.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum tasks per apply request.
    pub batch_size: usize,
    /// Bound on one delivery attempt, including the response.
    pub attempt_timeout: Duration,
    /// Retry behavior.
    pub retry: RetryConfig,
}

impl DispatchConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            batch_size: 50,
            attempt_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size (at least 1).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
///
/// After the n-th consecutive failure of a head entry the dispatcher waits
/// [`RetryConfig::delay_for_attempt`]`(n)`. The `max_retries`-th failure
/// marks the target unreachable; from then on it is probed every
/// `probe_interval`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failures before a target counts as unreachable.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
    /// Delay between probes of an unreachable target.
    pub probe_interval: Duration,
}

impl RetryConfig {
    /// Creates a configuration with the given retry bound.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
            probe_interval: Duration::from_secs(60),
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Sets the probe interval for unreachable targets.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Calculates the delay after `attempt` consecutive failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Wait before the next attempt after `failures` consecutive failures.
    pub fn wait_after(&self, failures: u32) -> Duration {
        if failures <= self.max_retries {
            self.delay_for_attempt(failures)
        } else {
            self.probe_interval
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
