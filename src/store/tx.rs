//! Transactional retry helper.
//!
//! `run_in_transaction` opens a fresh transaction per attempt, runs the unit
//! of work against it, and commits. Any error rolls the attempt back; the work
//! is retried with exponential backoff plus jitter until the retry budget is
//! spent, after which the last error is returned. Nothing from a failed
//! attempt is ever committed.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;

use crate::metrics;

/// Upper bound on a single backoff sleep.
pub const MAX_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `3` allows up to four attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (1-based): `base * 2^(retry-1) + U[0, base)`,
    /// capped at [`MAX_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let shift = retry.saturating_sub(1).min(20);
        let backoff = base.saturating_mul(1u64 << shift);
        let jitter = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base)
        };
        Duration::from_millis(backoff.saturating_add(jitter)).min(MAX_DELAY)
    }
}

/// A store that can hand out transactions.
#[async_trait]
pub trait Transactional: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> anyhow::Result<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()>;
    async fn rollback(&self, tx: Self::Tx) -> anyhow::Result<()>;
}

/// Run `work` inside a transaction, retrying per `policy`.
///
/// `work` is called once per attempt with that attempt's transaction and must
/// not carry state between attempts.
pub async fn run_in_transaction<B, T, F>(
    backend: &B,
    policy: &RetryPolicy,
    operation: &str,
    mut work: F,
) -> anyhow::Result<T>
where
    B: Transactional + ?Sized,
    T: Send,
    F: for<'t> FnMut(&'t mut B::Tx) -> BoxFuture<'t, anyhow::Result<T>> + Send,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match attempt_once(backend, operation, &mut work).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "transaction committed after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt > policy.max_retries => {
                tracing::error!(
                    operation,
                    attempts = attempt,
                    error = %e,
                    "transaction failed, retry budget exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transaction failed, retrying"
                );
                metrics::transaction_retry(operation);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn attempt_once<B, T, F>(backend: &B, operation: &str, work: &mut F) -> anyhow::Result<T>
where
    B: Transactional + ?Sized,
    T: Send,
    F: for<'t> FnMut(&'t mut B::Tx) -> BoxFuture<'t, anyhow::Result<T>> + Send,
{
    let mut tx = backend.begin().await?;

    match work(&mut tx).await {
        Ok(value) => {
            backend.commit(tx).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = backend.rollback(tx).await {
                tracing::warn!(operation, error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingBackend {
        begins: AtomicU32,
        commits: AtomicU32,
        rollbacks: AtomicU32,
        fail_rollback: bool,
    }

    #[async_trait]
    impl Transactional for CountingBackend {
        type Tx = Vec<&'static str>;

        async fn begin(&self) -> anyhow::Result<Self::Tx> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn commit(&self, _tx: Self::Tx) -> anyhow::Result<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _tx: Self::Tx) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.fail_rollback {
                anyhow::bail!("connection reset during rollback");
            }
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_fails_twice_then_commits_once() {
        let backend = CountingBackend::default();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = run_in_transaction(&backend, &fast_policy(), "test", move |tx| {
            let counter = counter.clone();
            Box::pin(async move {
                tx.push("write");
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    anyhow::bail!("deadlock detected");
                }
                Ok(n)
            })
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(backend.begins.load(Ordering::SeqCst), 3);
        assert_eq!(backend.commits.load(Ordering::SeqCst), 1);
        assert_eq!(backend.rollbacks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_original_error() {
        let backend = CountingBackend::default();

        let err = run_in_transaction(&backend, &fast_policy(), "test", |_tx| {
            Box::pin(async { Err::<(), _>(anyhow::anyhow!("unique violation")) })
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "unique violation");
        assert_eq!(backend.begins.load(Ordering::SeqCst), 4);
        assert_eq!(backend.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_error() {
        let backend = CountingBackend {
            fail_rollback: true,
            ..Default::default()
        };
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        };

        let err = run_in_transaction(&backend, &policy, "test", |_tx| {
            Box::pin(async { Err::<(), _>(anyhow::anyhow!("statement timeout")) })
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "statement timeout");
        assert_eq!(backend.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let first = policy.delay_for(1).as_millis();
            assert!((200..400).contains(&first), "first retry delay {first}");

            let second = policy.delay_for(2).as_millis();
            assert!((400..=5000).contains(&second), "second retry delay {second}");

            let late = policy.delay_for(12);
            assert_eq!(late, MAX_DELAY);
        }
    }

    #[test]
    fn test_zero_base_delay() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }
}
