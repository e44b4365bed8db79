//! Retry policy for request/response calls to ComfyUI.
//!
//! Gateway errors (502/503/504) and connection failures are retried
//! with exponential backoff. The completion-poll loop does not go
//! through this policy; it has its own fixed interval.

use std::time::Duration;

use reqwest::{Method, StatusCode};

/// Status codes treated as transient.
pub const RETRY_STATUSES: &[StatusCode] = &[
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Retry/backoff configuration.
///
/// The delay before retry `n` (1-indexed) is
/// `backoff_factor * 2^(n-1)`, clamped to `max_backoff`.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    pub backoff_factor: Duration,
    pub max_backoff: Duration,
    /// Whether POST requests (workflow submission) are retried too.
    pub retry_post: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_factor: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            retry_post: true,
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Total number of attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether the given status code should trigger a retry for this method.
    pub fn should_retry_status(&self, method: &Method, status: StatusCode) -> bool {
        RETRY_STATUSES.contains(&status) && self.allow_for_method(method)
    }

    /// Whether the given transport error should trigger a retry.
    pub fn should_retry_error(&self, method: &Method, err: &reqwest::Error) -> bool {
        err.is_connect() && self.allow_for_method(method)
    }

    /// Backoff before the retry that follows failed attempt `attempt`
    /// (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_factor.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_backoff)
    }

    fn allow_for_method(&self, method: &Method) -> bool {
        if method == Method::POST {
            return self.retry_post;
        }
        true
    }
}
