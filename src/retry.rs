//! Bounded retry with exponential backoff and per-attempt timeouts.
//!
//! Every call to an external service (embedding, generation, index) goes
//! through [`with_retry`]. An attempt that exceeds the timeout counts as a
//! retryable failure, so no call can hang the pipeline.
//!
//! Backoff doubles per attempt from `backoff_base`, capped at
//! `backoff_base × 2^5`.

use std::future::Future;
use std::time::Duration;

use mmrag_core::error::{EmbeddingError, GenerationError, IndexError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Limit for a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Policy for vector index calls. The index is local, so failures are
    /// usually lock contention and clear quickly.
    pub const INDEX: RetryPolicy = RetryPolicy {
        max_retries: 2,
        backoff_base: Duration::from_millis(100),
        timeout: Duration::from_secs(30),
    };

    pub fn new(max_retries: u32, backoff_base_ms: u64, timeout_secs: u64) -> Self {
        Self {
            max_retries,
            backoff_base: Duration::from_millis(backoff_base_ms),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    /// The error reported when an attempt times out.
    fn timed_out(after: Duration) -> Self;
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        EmbeddingError::is_retryable(self)
    }
    fn timed_out(after: Duration) -> Self {
        EmbeddingError::Unavailable(format!("timed out after {:?}", after))
    }
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        GenerationError::is_retryable(self)
    }
    fn timed_out(after: Duration) -> Self {
        GenerationError::Unavailable(format!("timed out after {:?}", after))
    }
}

impl Retryable for IndexError {
    fn is_retryable(&self) -> bool {
        IndexError::is_retryable(self)
    }
    fn timed_out(after: Duration) -> Self {
        IndexError::Backend(anyhow::anyhow!("timed out after {:?}", after))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last error is returned.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                warn!(
                    operation = what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, 100, 1);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(6), Duration::from_millis(3200));
        assert_eq!(p.backoff(9), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, GenerationError> = with_retry(&fast(3), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(GenerationError::Unavailable("busy".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), EmbeddingError> = with_retry(&fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EmbeddingError::InvalidContent("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), GenerationError> = with_retry(&fast(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::Unavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(GenerationError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };
        let result: Result<(), EmbeddingError> = with_retry(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(EmbeddingError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
