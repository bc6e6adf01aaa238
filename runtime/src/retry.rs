//! Exponential backoff for caller-driven command retries.
//!
//! The coordinator never retries on its own. A concurrency conflict is
//! reported back to the caller, who may resubmit; idempotency makes that safe.
//! [`retry_with_predicate`] is the loop behind
//! [`CommandCoordinator::execute_with_retry`](crate::coordinator::CommandCoordinator::execute_with_retry).
//!
//! # Example
//!
//! ```rust
//! use commandeer_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_secs(1))
//!     .multiplier(2.0)
//!     .build();
//!
//! let value = retry_with_predicate(
//!     policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("conflict"),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 50ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: true (each delay is scaled by a random factor in `[0.5, 1.0]`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: usize,
    /// Delay before the first retry
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Cap for exponential backoff
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Randomize delays so conflicting writers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay for a given attempt number without jitter.
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn base_delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Delay to wait before retry number `attempt`, with jitter applied if enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        base.mul_f64(factor)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// Returns the first `Ok`, the first non-retryable `Err`, or the last `Err`
/// once `policy.max_retries` retries are spent.
///
/// # Errors
///
/// Returns the operation's error when it is not retryable or retries are
/// exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    RetryMetrics::record_success();
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    RetryMetrics::record_exhausted();
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .jitter(false)
            .build()
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .jitter(false)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.base_delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for_attempt(500), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .jitter(true)
            .build();

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_deserialize_from_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 7, "initial_delay": 20}"#).unwrap();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_delay, Duration::from_millis(20));
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            fast_policy(3),
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    let attempt = c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(format!("conflict on attempt {attempt}"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |err: &String| err.contains("conflict"),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            fast_policy(2),
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("conflict")
                }
            },
            |_: &&str| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            fast_policy(5),
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("permanent error")
                }
            },
            |err: &&str| err.contains("conflict"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
