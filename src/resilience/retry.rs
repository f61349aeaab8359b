//! Retry policy: bounded attempts, exponential backoff with jitter for
//! transient failures, exact waits for server-imposed rate limits.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::RetryRuntime;
use crate::error::{RetryHint, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay before attempt `attempt + 1`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(u64::from(exponent)).min(max_ms))
    }

    pub async fn run<T, F, Fut>(&self, runtime: &RetryRuntime, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                return Err(err);
            }
            let delay = match err.retry_hint() {
                RetryHint::Never => return Err(err),
                RetryHint::WaitFor(wait) => wait,
                RetryHint::Backoff => runtime
                    .jitter
                    .jittered(self.backoff_delay(attempt), attempt),
            };
            debug!(attempt, ?delay, %err, "retrying after failure");
            runtime.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoJitter, RecordingSleeper};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn runtime(sleeper: Arc<RecordingSleeper>) -> RetryRuntime {
        RetryRuntime {
            sleeper,
            jitter: Arc::new(NoJitter),
        }
    }

    fn scripted(
        results: Vec<Result<u32, SyncError>>,
    ) -> Arc<Mutex<VecDeque<Result<u32, SyncError>>>> {
        Arc::new(Mutex::new(results.into()))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let rt = runtime(sleeper.clone());
        let script = scripted(vec![
            Err(SyncError::TransientNetwork("a".into())),
            Err(SyncError::TransientNetwork("b".into())),
            Ok(7),
        ]);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let value = policy
            .run(&rt, || {
                let script = script.clone();
                async move { script.lock().unwrap().pop_front().unwrap() }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn rate_limit_waits_exact_reset() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let rt = runtime(sleeper.clone());
        let script = scripted(vec![
            Err(SyncError::RateLimited {
                retry_after: Duration::from_secs(30),
            }),
            Ok(1),
        ]);
        RetryPolicy::default()
            .run(&rt, || {
                let script = script.clone();
                async move { script.lock().unwrap().pop_front().unwrap() }
            })
            .await
            .unwrap();
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let rt = runtime(sleeper.clone());
        let script = scripted(vec![Err(SyncError::AuthExpired), Ok(1)]);
        let err = RetryPolicy::default()
            .run(&rt, || {
                let script = script.clone();
                async move { script.lock().unwrap().pop_front().unwrap() }
            })
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::AuthExpired);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let rt = runtime(sleeper.clone());
        let calls = Arc::new(Mutex::new(0_u32));
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let err = policy
            .run(&rt, || {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err::<(), _>(SyncError::TransientNetwork("down".into()))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransientNetwork(_)));
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
