//! Shared rate budget fed by upstream response headers.
//!
//! Every request waits in `acquire` first. Once the remaining allowance
//! reported by the server falls under the low-water mark the wait grows in
//! proportion to how deep under the mark we are. A hard limit (420/429)
//! blocks everyone until the server-given reset.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::resilience::Sleeper;

pub const DEFAULT_HARD_LIMIT_WAIT: Duration = Duration::from_secs(60);
/// Header values beyond this are treated as this.
pub const MAX_SIGNAL_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

const REMAIN_HEADERS: [&str; 2] = ["x-esi-error-limit-remain", "x-ratelimit-remaining"];
const RESET_HEADERS: [&str; 2] = ["x-esi-error-limit-reset", "x-ratelimit-reset"];

/// Rate-limit information carried by one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSignal {
    pub remaining: Option<u32>,
    pub reset_in: Option<Duration>,
    pub retry_after: Option<Duration>,
}

impl RateSignal {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let number = |names: &[&str]| {
            names.iter().find_map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
            })
        };
        Self {
            remaining: number(&REMAIN_HEADERS).map(|v| u32::try_from(v).unwrap_or(u32::MAX)),
            reset_in: number(&RESET_HEADERS).map(clamped_secs),
            retry_after: number(&["retry-after"]).map(clamped_secs),
        }
    }

    /// How long a hard limit lasts: Retry-After, else the reset window.
    pub fn hard_limit_wait(&self) -> Duration {
        self.retry_after
            .or(self.reset_in)
            .unwrap_or(DEFAULT_HARD_LIMIT_WAIT)
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    remaining: Option<u32>,
    reset_at: Option<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

pub struct RateBudget {
    low_water: u32,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<BudgetState>,
}

impl RateBudget {
    pub fn new(low_water: u32, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            low_water,
            clock,
            sleeper,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Wait until a request may be issued.
    pub async fn acquire(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            debug!(?delay, "throttling upstream request");
            self.sleeper.sleep(delay).await;
        }
    }

    /// Delay the next request would incur right now.
    pub fn current_delay(&self) -> Duration {
        let now = self.clock.utc();
        let state = self.lock();
        if let Some(until) = state.blocked_until {
            if until > now {
                return to_std(until - now);
            }
        }
        match (state.remaining, state.reset_at) {
            (Some(remaining), Some(reset_at)) if remaining < self.low_water && reset_at > now => {
                let reset_in = to_std(reset_at - now);
                let deficit = self.low_water - remaining;
                reset_in.mul_f64(f64::from(deficit) / f64::from(self.low_water))
            }
            _ => Duration::ZERO,
        }
    }

    pub fn observe(&self, signal: &RateSignal) {
        let now = self.clock.utc();
        let mut state = self.lock();
        if let Some(remaining) = signal.remaining {
            state.remaining = Some(remaining);
        }
        if let Some(reset_in) = signal.reset_in {
            state.reset_at = Some(later(now, reset_in));
        }
    }

    /// Block every request until `wait` has elapsed. Never shortens an
    /// existing block.
    pub fn block_for(&self, wait: Duration) {
        let until = later(self.clock.utc(), wait.min(MAX_SIGNAL_WAIT));
        let mut state = self.lock();
        if state.blocked_until.map_or(true, |current| current < until) {
            warn!(wait_secs = wait.as_secs(), "upstream hard rate limit, pausing requests");
            state.blocked_until = Some(until);
        }
    }

    /// Last remaining allowance reported by the server.
    pub fn remaining(&self) -> Option<u32> {
        self.lock().remaining
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_std(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

fn clamped_secs(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_SIGNAL_WAIT)
}

fn later(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MutableClock, RecordingSleeper};
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn budget(low_water: u32) -> (RateBudget, Arc<MutableClock>, Arc<RecordingSleeper>) {
        let clock = Arc::new(MutableClock::new(
            Utc.with_ymd_and_hms(2026, 2, 2, 2, 0, 0).unwrap(),
        ));
        let sleeper = Arc::new(RecordingSleeper::with_clock(clock.clone()));
        (
            RateBudget::new(low_water, clock.clone(), sleeper.clone()),
            clock,
            sleeper,
        )
    }

    #[test]
    fn reads_esi_and_generic_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-ESI-Error-Limit-Remain", HeaderValue::from_static("87"));
        headers.insert("X-ESI-Error-Limit-Reset", HeaderValue::from_static("42"));
        let signal = RateSignal::from_headers(&headers);
        assert_eq!(signal.remaining, Some(87));
        assert_eq!(signal.reset_in, Some(Duration::from_secs(42)));
        assert_eq!(signal.hard_limit_wait(), Duration::from_secs(42));

        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("3"));
        headers.insert("Retry-After", HeaderValue::from_static("30"));
        let signal = RateSignal::from_headers(&headers);
        assert_eq!(signal.remaining, Some(3));
        assert_eq!(signal.hard_limit_wait(), Duration::from_secs(30));

        assert_eq!(
            RateSignal::default().hard_limit_wait(),
            DEFAULT_HARD_LIMIT_WAIT
        );
    }

    #[tokio::test]
    async fn above_low_water_no_delay() {
        let (budget, _clock, sleeper) = budget(20);
        budget.observe(&RateSignal {
            remaining: Some(50),
            reset_in: Some(Duration::from_secs(60)),
            retry_after: None,
        });
        budget.acquire().await;
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn below_low_water_delay_is_proportional() {
        let (budget, _clock, sleeper) = budget(20);
        budget.observe(&RateSignal {
            remaining: Some(5),
            reset_in: Some(Duration::from_secs(40)),
            retry_after: None,
        });
        budget.acquire().await;
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn hard_limit_blocks_until_reset() {
        let (budget, clock, sleeper) = budget(20);
        budget.block_for(Duration::from_secs(30));

        clock.advance(Duration::from_secs(10));
        assert_eq!(budget.current_delay(), Duration::from_secs(20));
        budget.acquire().await;
        assert_eq!(sleeper.total(), Duration::from_secs(20));
        assert_eq!(budget.current_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn absurd_reset_header_is_clamped() {
        let mut headers = HeaderMap::new();
        headers.insert("X-ESI-Error-Limit-Remain", HeaderValue::from_static("1"));
        headers.insert("X-ESI-Error-Limit-Reset", HeaderValue::from_static("9000000000000"));
        headers.insert("Retry-After", HeaderValue::from_static("18446744073709551615"));
        let signal = RateSignal::from_headers(&headers);
        assert_eq!(signal.reset_in, Some(MAX_SIGNAL_WAIT));
        assert_eq!(signal.hard_limit_wait(), MAX_SIGNAL_WAIT);

        let (budget, _clock, sleeper) = budget(20);
        budget.observe(&signal);
        budget.block_for(Duration::from_secs(u64::MAX));
        assert_eq!(budget.remaining(), Some(1));
        budget.acquire().await;
        assert_eq!(sleeper.total(), MAX_SIGNAL_WAIT);
    }

    #[test]
    fn shorter_block_does_not_shorten_existing() {
        let (budget, _clock, _sleeper) = budget(20);
        budget.block_for(Duration::from_secs(60));
        budget.block_for(Duration::from_secs(5));
        assert_eq!(budget.current_delay(), Duration::from_secs(60));
    }
}
