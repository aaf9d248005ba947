//! Bounded retry with exponential backoff for transient store failures.
//!
//! Sorted lock acquisition rules out deadlocks between reservation
//! transactions, but a store may still abort a transaction for reasons outside
//! the workflow's control (serialization failures, lock timeouts, dropped
//! connections). Those are re-run here from scratch; nothing else is.

use std::future::Future;
use std::time::Duration;

use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::WorkflowResult;
use crate::metrics::ServiceMetrics;

/// Total attempts, including the first. Between 1 and 10.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Delay before the first retry, in milliseconds. Between 10 ms and 10 s.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// As a [`Duration`].
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Cap on any single delay, in milliseconds. Between 100 ms and 5 min.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// As a [`Duration`].
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Growth factor between consecutive delays. Between 1.1 and 3.0.
#[nutype(
    validate(greater_or_equal = 1.1, less_or_equal = 3.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// How transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry.
    pub base_delay: RetryBaseDelayMs,
    /// Cap on any single delay.
    pub max_delay: RetryMaxDelayMs,
    /// Growth factor between delays.
    pub backoff_multiplier: BackoffMultiplier,
    /// Spread delays by ±20% so contenders do not retry in lockstep.
    pub use_jitter: bool,
}

impl RetryConfig {
    /// Five attempts starting at 20 ms, doubling up to 2 s, jittered.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self {
            max_attempts: MaxRetryAttempts::try_new(5)?,
            base_delay: RetryBaseDelayMs::try_new(20)?,
            max_delay: RetryMaxDelayMs::try_new(2_000)?,
            backoff_multiplier: BackoffMultiplier::try_new(2.0)?,
            use_jitter: true,
        })
    }

    /// A single attempt. Used where retries would hide the behavior under test.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: MaxRetryAttempts::try_new(1).expect("1 is a valid attempt count"),
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based; attempt 1 has none).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier: f64 = self.backoff_multiplier.into();
        let base_ms = self.base_delay.as_duration().as_millis() as f64;
        let raw_ms = base_ms * multiplier.powi((attempt - 2) as i32);
        let capped = Duration::from_millis(raw_ms as u64).min(self.max_delay.as_duration());

        if self.use_jitter {
            let factor = rand::rng().random_range(0.8..1.2);
            Duration::from_millis((capped.as_millis() as f64 * factor) as u64)
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new().expect("Default retry configuration should always be valid")
    }
}

/// Runs `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Only errors for which [`crate::WorkflowError::is_transient`] holds are
/// retried; the last error is returned unchanged.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    metrics: &ServiceMetrics,
    operation_name: &str,
    mut operation: F,
) -> WorkflowResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WorkflowResult<T>>,
{
    let max_attempts: u32 = config.max_attempts.into();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "[retry] succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                attempt += 1;
                let delay = config.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "[retry] transient store failure; retrying"
                );
                metrics.retries.increment();
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
