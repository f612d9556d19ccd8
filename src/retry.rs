// src/retry.rs

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Retry configuration for broker-facing operations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first failed attempt
    pub max_retries: u32,

    /// Base delay in seconds fed into [`backoff_delay`]
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Create a new retry policy with defaults
    ///
    /// Defaults:
    /// - max_retries: 3
    /// - backoff_factor: 5.0
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Total number of attempts before giving up.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay scheduled after the given 1-based attempt fails.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_factor, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 5.0,
        }
    }
}

/// Delay before the next attempt: `backoff_factor * 2^(attempt - 1)` seconds.
///
/// `attempt` is 1-based. A product too large to represent saturates to
/// `Duration::MAX`; a negative or NaN product clamps to zero rather than
/// panicking.
pub fn backoff_delay(backoff_factor: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let secs = backoff_factor * 2f64.powi(exponent as i32);
    match Duration::try_from_secs_f64(secs) {
        Ok(delay) => delay,
        Err(_) if secs > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

/// Retry an async operation with exponential backoff, no observers.
pub async fn run_with_retry<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run_with_retry_hooks(policy, operation, |_, _| {}, |_| {}).await
}

/// Retry an async operation with exponential backoff.
///
/// The operation runs at most `policy.max_retries + 1` times. Every failure
/// invokes `on_failure(error, attempt)` and then backs off for
/// [`backoff_delay`] of that attempt number before the next try; the final
/// failure additionally invokes `on_exhausted(attempts)` and the last error
/// is returned. Attempt numbers are 1-based.
///
/// # Example
/// ```ignore
/// let policy = RetryPolicy::new().with_backoff_factor(0.5);
/// let connection = run_with_retry_hooks(
///     policy,
///     || connector.create_mq_connection("/", None),
///     |err, attempt| warn!(attempt, "connect failed: {err}"),
///     |attempts| error!(attempts, "broker unreachable"),
/// )
/// .await?;
/// ```
pub async fn run_with_retry_hooks<F, Fut, T, E, OnFailure, OnExhausted>(
    policy: RetryPolicy,
    mut operation: F,
    mut on_failure: OnFailure,
    on_exhausted: OnExhausted,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    OnFailure: FnMut(&E, u32),
    OnExhausted: FnOnce(u32),
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => {
                on_failure(&err, attempt);
                let delay = policy.delay_for(attempt);
                if attempt < policy.total_attempts() {
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "attempt failed, backing off before retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                } else {
                    error!(
                        attempts = attempt,
                        error = %err,
                        "operation failed after exhausting retries"
                    );
                    sleep(delay).await;
                    on_exhausted(attempt);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_backoff_factor(0.001)
    }

    #[test]
    fn backoff_delay_doubles_per_attempt() {
        assert_eq!(backoff_delay(0.1, 1), Duration::from_secs_f64(0.1));
        assert_eq!(backoff_delay(0.1, 2), Duration::from_secs_f64(0.2));
        assert_eq!(backoff_delay(0.1, 3), Duration::from_secs_f64(0.4));
        assert_eq!(backoff_delay(5.0, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(5.0, 4), Duration::from_secs(40));
    }

    #[test]
    fn backoff_delay_is_monotonic() {
        for attempt in 1..12 {
            assert!(backoff_delay(0.3, attempt + 1) >= backoff_delay(0.3, attempt));
        }
    }

    #[test]
    fn backoff_delay_never_panics_on_bad_factor() {
        assert_eq!(backoff_delay(-1.0, 3), Duration::ZERO);
        assert_eq!(backoff_delay(f64::NAN, 2), Duration::ZERO);
        assert_eq!(backoff_delay(f64::INFINITY, 1), Duration::MAX);
    }

    #[test]
    fn backoff_delay_saturates_instead_of_wrapping_to_zero() {
        // 5.0 * 2^63 seconds no longer fits in a Duration
        assert_eq!(backoff_delay(5.0, 64), Duration::MAX);
        assert!(backoff_delay(5.0, 64) >= backoff_delay(5.0, 62));
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_factor, 5.0);
        assert_eq!(policy.total_attempts(), 4);
    }

    #[tokio::test]
    async fn first_attempt_success_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();

        let result = run_with_retry(quick(3), || {
            let calls = counted.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let failures_seen = Arc::new(AtomicU32::new(0));
        let failures = failures_seen.clone();

        let result = run_with_retry_hooks(
            quick(3),
            || {
                let calls = counted.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(format!("boom {n}"))
                    } else {
                        Ok("recovered")
                    }
                }
            },
            |_err, attempt| {
                failures.fetch_add(1, Ordering::SeqCst);
                assert!(attempt >= 1);
            },
            |_| panic!("must not exhaust"),
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failures_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_runs_max_retries_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let exhausted_at = Arc::new(AtomicU32::new(0));
        let exhausted = exhausted_at.clone();

        let result = run_with_retry_hooks(
            quick(2),
            || {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("always fails")
                }
            },
            |_, _| {},
            |attempts| {
                exhausted.store(attempts, Ordering::SeqCst);
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "always fails");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exhausted_at.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();

        let result = run_with_retry(quick(0), || {
            let calls = counted.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("fatal")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
