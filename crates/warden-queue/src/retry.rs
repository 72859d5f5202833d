//! Exponential backoff with jitter around fallible async operations.
//!
//! Only read/compute calls (diff fetch, LLM review) go through here.
//! Notification sends are never retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};
use warden_core::{QueueConfig, WardenError};

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Worth another attempt.
    Retryable,
    /// Give up immediately.
    Terminal,
}

/// Classify by [`WardenError::is_transient`].
pub fn default_classifier(error: &WardenError) -> Retryability {
    if error.is_transient() {
        Retryability::Retryable
    } else {
        Retryability::Terminal
    }
}

/// Attempt budget and backoff curve.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_queue::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(250));
/// let first = policy.delay_for(1);
/// assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
/// assert_eq!(policy.delay_for(5), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay unit; also the upper bound of the jitter.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Budget for each individual attempt.
    pub call_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Policy without a per-attempt timeout.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            call_timeout: None,
        }
    }

    /// Policy from the `[queue]` table, per-call timeout included.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
            call_timeout: Some(config.per_call_timeout()),
        }
    }

    /// Bound each attempt by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `min(base * 2^(attempt-1) + jitter, max)` with jitter in `[0, base)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..base_ms)
        };
        Duration::from_millis(exponential.saturating_add(jitter)).min(self.max_delay)
    }
}

/// State handed to the observer before each backoff sleep.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Operation name.
    pub operation: &'a str,
    /// The attempt that just failed.
    pub attempt: u32,
    /// Its error.
    pub last_error: &'a WardenError,
    /// Sleep before the next attempt.
    pub next_delay: Duration,
}

/// A successful result and the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Value of the successful attempt.
    pub value: T,
    /// Attempts used, at least 1.
    pub attempts: u32,
}

/// Final failure of a retried operation.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RetryError {
    /// Operation name.
    pub operation: String,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error of the last attempt.
    #[source]
    pub source: WardenError,
}

/// Await one outbound call for at most `limit`.
///
/// Callers that queue for a pool lease first should wrap only the call
/// itself, so waiting for a slot never eats into the budget.
///
/// # Errors
///
/// Returns the call's own error, or [`WardenError::Timeout`] when `limit`
/// expires first.
pub async fn bounded_call<T, Fut>(operation: &str, limit: Duration, call: Fut) -> Result<T, WardenError>
where
    Fut: Future<Output = Result<T, WardenError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(WardenError::Timeout(format!(
            "{operation} exceeded {} ms",
            limit.as_millis()
        ))),
    }
}

/// Run `op` until it succeeds, fails terminally, or runs out of attempts.
///
/// `observe` is called once per scheduled retry, before sleeping. A per-call
/// timeout that fires counts as a failed attempt with
/// [`WardenError::Timeout`], which the default classifier retries.
///
/// # Errors
///
/// Returns [`RetryError`] carrying the last error and the attempt count.
pub async fn run_with_retry<T, F, Fut, C, O>(
    operation: &str,
    policy: &RetryPolicy,
    classify: C,
    mut observe: O,
    mut op: F,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WardenError>>,
    C: Fn(&WardenError) -> Retryability,
    O: FnMut(&RetryContext<'_>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match policy.call_timeout {
            Some(limit) => bounded_call(operation, limit, op()).await,
            None => op().await,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) => error,
        };

        if classify(&error) == Retryability::Terminal || attempt >= max_attempts {
            return Err(RetryError {
                operation: operation.to_string(),
                attempts: attempt,
                source: error,
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after error"
        );
        observe(&RetryContext {
            operation,
            attempt,
            last_error: &error,
            next_delay: delay,
        });
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(2), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn always_retryable_uses_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut delays = Vec::new();

        let err = run_with_retry(
            "fetch",
            &fast_policy(4),
            |_| Retryability::Retryable,
            |ctx| delays.push(ctx.next_delay),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(WardenError::Network("reset".into()))
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn terminal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = run_with_retry(
            "review",
            &fast_policy(5),
            default_classifier,
            |_| panic!("no retry expected"),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(WardenError::Llm("invalid api key".into()))
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.source, WardenError::Llm(_)));
        assert!(err.to_string().starts_with("review failed after 1 attempt(s)"));
    }

    #[tokio::test]
    async fn success_reports_attempts_used() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let retried = run_with_retry(
            "fetch",
            &fast_policy(3),
            default_classifier,
            |_| {},
            move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(WardenError::RateLimited("slow down".into()))
                } else {
                    Ok(n)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(retried.value, 3);
        assert_eq!(retried.attempts, 3);
    }

    #[tokio::test]
    async fn call_timeout_counts_as_transient_failure() {
        let policy = fast_policy(2).with_call_timeout(Duration::from_millis(10));
        let err = run_with_retry(
            "review",
            &policy,
            default_classifier,
            |_| {},
            || async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert!(matches!(err.source, WardenError::Timeout(_)));
    }

    #[tokio::test]
    async fn bounded_call_passes_through_fast_results() {
        let value = bounded_call("fetch", Duration::from_millis(200), async { Ok::<_, WardenError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = bounded_call("fetch", Duration::from_millis(200), async {
            Err::<(), _>(WardenError::Git("bad revision".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WardenError::Git(_)));
    }

    #[tokio::test]
    async fn bounded_call_times_out_slow_calls() {
        let err = bounded_call("review_chunk[0]", Duration::from_millis(10), async {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, WardenError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(&err, WardenError::Timeout(m) if m.contains("review_chunk[0] exceeded 10 ms")));
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let second = policy.delay_for(2);
            assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(300));
            assert_eq!(policy.delay_for(8), Duration::from_secs(1));
        }
    }

    #[test]
    fn zero_base_delay_has_no_jitter() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn from_config_reads_queue_table() {
        let config = QueueConfig::default();
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, config.max_retry_attempts);
        assert_eq!(policy.call_timeout, Some(config.per_call_timeout()));
    }
}
