//! Retry and circuit-breaker plumbing shared by every outbound call.

pub mod breaker;
pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{Domain, SyncError};

pub use breaker::{BreakerSettings, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub trait BackoffJitter: Send + Sync {
    fn jittered(&self, base: Duration, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Adds up to 25% of the base delay at random.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl BackoffJitter for RandomJitter {
    fn jittered(&self, base: Duration, _attempt: u32) -> Duration {
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let max_extra = (base_ms / 4).max(1);
        let extra = rand::thread_rng().gen_range(0..=max_extra);
        Duration::from_millis(base_ms.saturating_add(extra))
    }
}

#[derive(Clone)]
pub struct RetryRuntime {
    pub sleeper: Arc<dyn Sleeper>,
    pub jitter: Arc<dyn BackoffJitter>,
}

impl Default for RetryRuntime {
    fn default() -> Self {
        Self {
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
        }
    }
}

/// Retry wrapped around a breaker: every attempt passes through the breaker,
/// and an open breaker ends the retry loop immediately.
#[derive(Clone)]
pub struct Guard {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    runtime: RetryRuntime,
}

impl Guard {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy, runtime: RetryRuntime) -> Self {
        Self {
            breaker,
            policy,
            runtime,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn domain(&self) -> Domain {
        self.breaker.domain()
    }

    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let domain = self.domain();
        self.policy
            .run(&self.runtime, || self.breaker.call(op()))
            .await
            .map_err(|err| err.exhausted(domain))
    }

    /// A single attempt through the breaker, for writes that must not be
    /// repeated once their outcome is unknown.
    pub async fn call_once<T, Fut>(&self, op: Fut) -> Result<T, SyncError>
    where
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let domain = self.domain();
        self.breaker.call(op).await.map_err(|err| err.exhausted(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MutableClock, NoJitter, RecordingSleeper};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(threshold: u32, attempts: u32) -> (Guard, Arc<RecordingSleeper>) {
        let clock = Arc::new(MutableClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            Domain::Upstream,
            BreakerSettings {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
            },
            clock,
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let runtime = RetryRuntime {
            sleeper: sleeper.clone(),
            jitter: Arc::new(NoJitter),
        };
        let policy = RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        (Guard::new(breaker, policy, runtime), sleeper)
    }

    #[tokio::test]
    async fn exhausted_retries_map_to_domain_error() {
        let (guard, sleeper) = guard(10, 3);
        let err = guard
            .call(|| async { Err::<(), _>(SyncError::TransientNetwork("reset".into())) })
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::UpstreamUnavailable("reset".into()));
        assert_eq!(sleeper.recorded().len(), 2);
    }

    #[tokio::test]
    async fn open_breaker_stops_retry_loop() {
        let (guard, _sleeper) = guard(2, 5);
        let calls = &AtomicUsize::new(0);
        let err = guard
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::TransientNetwork("reset".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::CircuitOpen(Domain::Upstream));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(guard.breaker().state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn single_attempt_is_not_retried() {
        let (guard, sleeper) = guard(10, 5);
        let calls = AtomicUsize::new(0);
        let err = guard
            .call_once(async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::TransientNetwork("timed out".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::UpstreamUnavailable("timed out".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.recorded().is_empty());
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 1);
    }

    #[test]
    fn random_jitter_stays_within_quarter() {
        let base = Duration::from_millis(400);
        for attempt in 1..20 {
            let delay = RandomJitter.jittered(base, attempt);
            assert!(delay >= base && delay <= Duration::from_millis(500));
        }
    }
}
