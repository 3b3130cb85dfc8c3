//! Retry Policy
//!
//! Bounded retry with growing backoff for remote operations, plus the
//! optional run deadline every remote call is held to.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Retry policy applied to every remote operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay` before attempt `n + 1`
    base_delay: Duration,
    /// Hard stop for the whole run
    deadline: Option<Instant>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            deadline: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    /// Bound every attempt and backoff sleep by `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Same attempts and backoff, held to `budget` from now instead of the
    /// run deadline. Used for restore steps that must still run after the
    /// run deadline has passed.
    pub fn detached(&self, budget: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + budget),
            ..self.clone()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Backoff after the given 1-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match self.within_deadline(operation, op()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if attempt >= self.max_attempts {
                        return Err(Error::RetryExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    self.sleep(operation, delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Await `fut` unless the run deadline passes first
    pub async fn within_deadline<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::Timeout(format!("{} exceeded the run deadline", operation)))?,
            None => fut.await,
        }
    }

    /// Sleep for `delay`, failing early if the deadline would pass
    pub async fn sleep(&self, operation: &str, delay: Duration) -> Result<()> {
        sleep_within(self.deadline, operation, delay).await
    }
}

/// Sleep for `delay` unless that would cross `deadline`, in which case sleep
/// until the deadline and fail with `Error::Timeout`.
pub async fn sleep_within(
    deadline: Option<Instant>,
    operation: &str,
    delay: Duration,
) -> Result<()> {
    if let Some(deadline) = deadline {
        if Instant::now() + delay > deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(Error::Timeout(format!(
                "{} exceeded the run deadline",
                operation
            )));
        }
    }
    tokio::time::sleep(delay).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }

    #[test]
    fn test_delay_grows_with_attempt() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failure() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let calls = &AtomicU32::new(0);

        let value = policy
            .run("fetch", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let calls = &AtomicU32::new(0);

        let result: Result<()> = policy
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Parse("bad".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Parse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_cause() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = &AtomicU32::new(0);

        let result: Result<()> = policy
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        match result {
            Err(Error::RetryExhausted { operation, attempts, source }) => {
                assert_eq!(operation, "fetch");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Io(_)));
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_stops_hung_operation() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1))
            .with_deadline(Instant::now() + Duration::from_millis(20));

        let result: Result<()> = policy
            .run("hang", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_sleep_within_deadline() {
        assert!(sleep_within(None, "pause", Duration::from_millis(1)).await.is_ok());

        let deadline = Instant::now() + Duration::from_millis(5);
        let result = sleep_within(Some(deadline), "pause", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test]
    async fn test_detached_policy_outlives_run_deadline() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1))
            .with_deadline(Instant::now() - Duration::from_millis(1));

        let slow = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(1)
        };

        let expired: Result<u32> = policy.run("restore", slow).await;
        assert!(matches!(expired, Err(Error::Timeout(_))));

        let restore = policy.detached(Duration::from_secs(5));
        assert_eq!(restore.max_attempts(), 2);
        assert!(restore.deadline().unwrap() > Instant::now());
        assert_eq!(restore.run("restore", slow).await.unwrap(), 1);

        let hung: Result<()> = policy
            .detached(Duration::from_millis(10))
            .run("restore", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(hung, Err(Error::Timeout(_))));
    }
}
