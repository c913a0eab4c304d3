//! Bounded retry with exponential backoff.

use std::future::Future;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::{Error, Result};

/// Re-run `attempt` while it fails with an error `retry_on` accepts, up to
/// the policy's attempt budget. The last error is returned unchanged once
/// the budget is spent.
pub async fn retry_when<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    retry_on: fn(&Error) -> bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut n = 1;
    loop {
        match attempt().await {
            Err(e) if retry_on(&e) && n < policy.max_attempts => {
                let wait = policy.backoff(n);
                debug!(op, attempt = n, backoff_ms = wait.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(wait).await;
                n += 1;
            }
            Err(e) if retry_on(&e) => {
                warn!(op, attempts = n, error = %e, "retries exhausted");
                return Err(e);
            }
            other => return other,
        }
    }
}

/// Retry write-write conflicts.
pub async fn on_conflict<T, F, Fut>(policy: &RetryPolicy, op: &str, attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(policy, op, |e| matches!(e, Error::Conflict(_)), attempt).await
}

/// Retry an unreachable backend.
pub async fn on_unavailable<T, F, Fut>(policy: &RetryPolicy, op: &str, attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(policy, op, |e| matches!(e, Error::Unavailable(_)), attempt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, initial_backoff_ms: 1, max_backoff_ms: 2 }
    }

    #[tokio::test]
    async fn test_conflict_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = on_conflict(&fast(5), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Conflict("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_budget() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = on_conflict(&fast(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Conflict("busy".into()))
        })
        .await;
        assert!(matches!(res, Err(Error::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = on_conflict(&fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("x".into()))
        })
        .await;
        assert!(matches!(res, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
