//! Capped exponential backoff for catalog calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::CatalogError;
use crate::metrics::METRICS;

/// Hard ceiling on the computed backoff between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry budget for a single catalog call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Upper bound on a server-requested `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: MAX_BACKOFF,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff after failed attempt `attempt` (1-based). A server-provided
    /// `Retry-After` replaces the computed value, up to `max_retry_after`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(requested) = retry_after {
            return requested.min(self.max_retry_after);
        }
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .min(MAX_BACKOFF)
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects, or
/// the budget is spent. Never makes more than `max_retries + 1` attempts.
pub async fn retry_with<T, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    should_retry: C,
    mut op: F,
) -> Result<T, CatalogError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CatalogError>>,
    C: Fn(&CatalogError) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !should_retry(&err) => return Err(err),
            Err(err) if attempt >= max_attempts => {
                return Err(CatalogError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt, err.retry_after());
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "catalog call failed, retrying",
                );
                METRICS.inc_catalog_retries();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry only transient failures (throttling, 5xx, connection errors).
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> Result<T, CatalogError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CatalogError>>,
{
    retry_with(policy, operation, CatalogError::is_transient, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn throttled() -> CatalogError {
        CatalogError::Throttled { retry_after: None }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, None), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5, None), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40, None), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(45))),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn test_retry_after_is_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_configured_max_delay_cannot_exceed_hard_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(600),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(6, None), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded_by_max_retries() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry_transient(&policy, "test", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(throttled())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::Relaxed), policy.max_retries + 1);
        match result.unwrap_err() {
            CatalogError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_sleeps_longer_than_cap() {
        let policy = RetryPolicy {
            max_retries: 8,
            ..RetryPolicy::default()
        };
        let last = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));
        let longest = Arc::new(std::sync::Mutex::new(Duration::ZERO));

        let _: Result<(), _> = retry_transient(&policy, "test", |_| {
            let last = last.clone();
            let longest = longest.clone();
            async move {
                let now = tokio::time::Instant::now();
                let mut last = last.lock().unwrap();
                let gap = now - *last;
                let mut longest = longest.lock().unwrap();
                if gap > *longest {
                    *longest = gap;
                }
                *last = now;
                Err(throttled())
            }
        })
        .await;

        assert_eq!(*longest.lock().unwrap(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry_transient(&policy, "test", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(CatalogError::Api {
                    status: 404,
                    body: "no such backup".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(matches!(result, Err(CatalogError::Api { status: 404, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy::default();
        let result = retry_transient(&policy, "test", |attempt| async move {
            if attempt < 3 {
                Err(CatalogError::Transient {
                    status: 503,
                    body: String::new(),
                    retry_after: None,
                })
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
    }
}
