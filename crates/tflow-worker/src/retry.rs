//! Retry utilities with exponential backoff.
//!
//! [`BackoffPolicy`] decides when a transiently failed job is offered
//! again. [`retry_async`] and [`FailureTracker`] cover the worker's own
//! short-lived writes to the queue (outcome recording, heartbeats).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Job re-offer delay: `min(base * 2^(attempt-1), cap)`, scaled by a
/// random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Create policy from environment variables.
    pub fn from_env() -> Self {
        Self {
            base: Duration::from_millis(
                std::env::var("WORKER_RETRY_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2_000),
            ),
            cap: Duration::from_millis(
                std::env::var("WORKER_RETRY_MAX_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300_000),
            ),
            jitter: std::env::var("WORKER_RETRY_JITTER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.25),
        }
    }

    /// Delay without jitter after `attempt` (1-based) failed.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Delay with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = self.base_delay(attempt);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Base delay for exponential backoff (doubles each attempt).
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Operation name for logging.
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Execute an async operation, retrying failures that `is_retryable`
/// accepts with exponential backoff.
///
/// Returns the first non-retryable error, or the last error once
/// `max_retries` is exhausted.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_retryable: P,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries && is_retryable(&e) => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(
                    operation = %config.operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Suppresses log spam from a background task that keeps failing.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    /// Record a successful operation (resets failure count).
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 && self.suppressed {
            debug!(
                failures = self.consecutive_failures,
                "Operation recovered after consecutive failures"
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Record a failed operation.
    ///
    /// Returns `true` if this failure should be logged (not suppressed).
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else if self.consecutive_failures == self.max_logged_failures + 1 {
            self.suppressed = true;
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
            false
        } else {
            false
        }
    }
}
