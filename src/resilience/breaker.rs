//! Circuit breaker state machine (closed / open / half-open).

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use tracing::{info, warn};

use crate::error::{Domain, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures required to open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before one half-open trial is allowed.
    pub recovery_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Internal {
    Closed { consecutive_failures: u32 },
    Open { opened_at: DateTime<Utc>, failures: u32 },
    HalfOpen { trial_started: DateTime<Utc>, failures: u32 },
}

#[derive(Debug)]
struct Inner {
    state: Internal,
    last_failure_at: Option<DateTime<Utc>>,
}

/// One breaker per failure domain. Cheap to share behind an `Arc`.
pub struct CircuitBreaker {
    domain: Domain,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(domain: Domain, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            domain,
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                recovery_timeout: settings.recovery_timeout,
            },
            clock,
            inner: Mutex::new(Inner {
                state: Internal::Closed {
                    consecutive_failures: 0,
                },
                last_failure_at: None,
            }),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Run `op` if the breaker admits it. A denied call never polls `op`.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T, SyncError>
    where
        Fut: Future<Output = Result<T, SyncError>>,
    {
        if !self.try_admit() {
            return Err(SyncError::CircuitOpen(self.domain));
        }
        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if err.counts_against_breaker() => {
                self.record_failure();
                Err(err)
            }
            Err(err) => {
                // The remote answered; only its health matters here.
                self.record_success();
                Err(err)
            }
        }
    }

    /// Decide whether one call may proceed, moving Open -> HalfOpen when due.
    pub fn try_admit(&self) -> bool {
        let now = self.clock.utc();
        let mut inner = self.lock();
        match inner.state {
            Internal::Closed { .. } => true,
            Internal::Open { opened_at, failures } if self.elapsed(opened_at, now) => {
                info!(domain = %self.domain, "circuit half-open, admitting trial call");
                inner.state = Internal::HalfOpen {
                    trial_started: now,
                    failures,
                };
                true
            }
            Internal::Open { .. } => false,
            // A trial call whose caller vanished (cancelled future) must not wedge the breaker.
            Internal::HalfOpen {
                trial_started,
                failures,
            } if self.elapsed(trial_started, now) => {
                inner.state = Internal::HalfOpen {
                    trial_started: now,
                    failures,
                };
                true
            }
            Internal::HalfOpen { .. } => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(inner.state, Internal::Closed { .. }) {
            info!(domain = %self.domain, "circuit closed");
        }
        inner.state = Internal::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let now = self.clock.utc();
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        inner.state = match inner.state {
            Internal::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures.saturating_add(1);
                if failures >= self.settings.failure_threshold {
                    warn!(domain = %self.domain, failures, "circuit opened");
                    Internal::Open {
                        opened_at: now,
                        failures,
                    }
                } else {
                    Internal::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            Internal::HalfOpen { failures, .. } => {
                warn!(domain = %self.domain, "trial call failed, circuit re-opened");
                Internal::Open {
                    opened_at: now,
                    failures: failures.saturating_add(1),
                }
            }
            Internal::Open { opened_at, failures } => Internal::Open {
                opened_at,
                failures: failures.saturating_add(1),
            },
        };
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let (state, consecutive_failures) = match inner.state {
            Internal::Closed {
                consecutive_failures,
            } => (BreakerState::Closed, consecutive_failures),
            Internal::Open { failures, .. } => (BreakerState::Open, failures),
            Internal::HalfOpen { failures, .. } => (BreakerState::HalfOpen, failures),
        };
        BreakerSnapshot {
            state,
            consecutive_failures,
            last_failure_at: inner.last_failure_at,
            failure_threshold: self.settings.failure_threshold,
            recovery_timeout: self.settings.recovery_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.snapshot().state
    }

    fn elapsed(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.settings.recovery_timeout)
            .ok()
            .and_then(|timeout| since.checked_add_signed(timeout))
            .map_or(false, |due| now >= due)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
