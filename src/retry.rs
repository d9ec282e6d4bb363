//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How retry delays grow across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial * coefficient^(attempt - 1)`
    Exponential,
    /// `initial * attempt`
    Linear,
}

/// Controls retry behavior for activities.
///
/// Delays grow per [`BackoffStrategy`], are capped at `max_interval`, and can
/// carry +/- `jitter` fractional randomness to avoid thundering herds.
///
/// # Example
///
/// ```
/// use durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second, then ~2, ~4, ...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the initial one. `0` means
    /// unlimited.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor for the exponential strategy.
    pub backoff_coefficient: f64,

    /// Jitter fraction in `0.0..=1.0`; `0.1` means +/- 10%.
    pub jitter: f64,

    /// Delay growth strategy.
    pub strategy: BackoffStrategy,

    /// Failure codes that must not be retried regardless of budget.
    #[serde(default)]
    pub non_retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults: 5 attempts, 1s initial,
    /// 60s cap, 2x growth, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            strategy: BackoffStrategy::Exponential,
            non_retryable_codes: vec![],
        }
    }

    /// Linear backoff: delay grows by `initial_interval` per attempt.
    pub fn linear(initial_interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval,
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 1.0,
            jitter: 0.0,
            strategy: BackoffStrategy::Linear,
            non_retryable_codes: vec![],
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            strategy: BackoffStrategy::Exponential,
            non_retryable_codes: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_non_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_codes.push(code.into());
        self
    }

    /// Delay to wait after `attempt` (1-based) just failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.strategy {
            BackoffStrategy::Linear => self.initial_interval.as_secs_f64() * attempt as f64,
            BackoffStrategy::Exponential => {
                self.initial_interval.as_secs_f64()
                    * self.backoff_coefficient.powi(attempt as i32 - 1)
            }
        };
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let delta = capped * self.jitter;
            let offset = rng.gen_range(-delta..delta);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Whether a failure with the given code may be retried.
    pub fn retryable_code(&self, code: Option<&str>) -> bool {
        match code {
            Some(code) => !self.non_retryable_codes.iter().any(|c| c == code),
            None => true,
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
