//! Backoff policy for retried provider requests.

use std::time::Duration;

/// Exponential backoff with a cap and additive random jitter.
///
/// The delay before retry `attempt` (0-based) is
/// `min(base * factor^attempt, max)` plus a uniform random 10-50% of that
/// value, so synchronized callers spread out instead of retrying in step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Capped exponential delay for an attempt, before jitter.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    /// Delay for an attempt with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        let jitter_fraction = 0.1 + fastrand::f64() * 0.4;
        raw + Duration::from_secs_f64(raw.as_secs_f64() * jitter_fraction)
    }
}

/// Retry behavior for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// HTTP status codes that warrant another attempt.
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff: BackoffPolicy::default(),
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}
