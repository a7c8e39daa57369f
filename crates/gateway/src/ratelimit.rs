//! Fixed-window request limiting per account.
//!
//! Counters are keyed by `(account, window id)` where the window id is wall
//! clock seconds divided by the window length. The first increment of a
//! window sets its expiry; the count is compared after incrementing and a
//! rejected attempt is not refunded. Bursts of up to twice the ceiling across
//! a window boundary are accepted.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::context::Context;
use crate::counter::CounterStore;
use crate::error::{AdmissionError, Stage, bounded};
use crate::model::AccountId;

/// Outcome of an admitted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    /// `None` when the plan is unlimited.
    pub ceiling: Option<u32>,
    /// Requests counted in the current window, this one included.
    pub used: u64,
}

impl RateStatus {
    pub fn remaining(&self) -> Option<u64> {
        self.ceiling
            .map(|ceiling| u64::from(ceiling).saturating_sub(self.used))
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(ctx: &Context) -> Self {
        Self {
            counters: ctx.counters.clone(),
            clock: ctx.clock.clone(),
            window: ctx.rate_window,
            timeout: ctx.store_timeout,
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    fn window_id(&self, now_secs: i64) -> i64 {
        now_secs.div_euclid(self.window_secs() as i64)
    }

    pub fn counter_key(&self, account_id: AccountId, now_secs: i64) -> String {
        format!("rl:{account_id}:{}", self.window_id(now_secs))
    }

    /// Count one request against `ceiling`. Zero or `None` means unlimited
    /// and touches no counter.
    pub async fn check(
        &self,
        account_id: AccountId,
        ceiling: Option<u32>,
    ) -> Result<RateStatus, AdmissionError> {
        let Some(ceiling) = ceiling.filter(|c| *c > 0) else {
            return Ok(RateStatus {
                ceiling: None,
                used: 0,
            });
        };

        let key = self.counter_key(account_id, self.clock.unix_secs());
        let used = bounded(
            Stage::RateLimit,
            self.timeout,
            self.counters
                .incr_with_expiry(&key, Duration::from_secs(self.window_secs())),
        )
        .await?;

        if used > u64::from(ceiling) {
            log::debug!("account {account_id} over rate limit: {used}/{ceiling}");
            return Err(AdmissionError::RateLimitExceeded {
                ceiling,
                window_secs: self.window_secs(),
            });
        }
        Ok(RateStatus {
            ceiling: Some(ceiling),
            used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::counter::MemoryCounterStore;
    use crate::store::test_support::temp_store;
    use chrono::TimeDelta;

    async fn limiter(clock: Arc<ManualClock>) -> (tempfile::TempDir, RateLimiter, Arc<MemoryCounterStore>) {
        let (dir, store) = temp_store().await;
        let counters = Arc::new(MemoryCounterStore::new());
        let ctx = Context::new(store)
            .with_clock(clock)
            .with_counters(counters.clone())
            .with_rate_window(Duration::from_secs(60));
        (dir, RateLimiter::new(&ctx), counters)
    }

    #[tokio::test]
    async fn rejects_request_over_ceiling() {
        let clock = Arc::new(ManualClock::at(120));
        let (_dir, limiter, _) = limiter(clock).await;

        for expected in 1..=3 {
            let status = limiter.check(7, Some(3)).await.unwrap();
            assert_eq!(status.used, expected);
            assert_eq!(status.remaining(), Some(3 - expected));
        }
        let err = limiter.check(7, Some(3)).await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::RateLimitExceeded {
                ceiling: 3,
                window_secs: 60
            }
        ));
        // Other accounts have their own counter.
        assert_eq!(limiter.check(8, Some(3)).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn new_window_starts_fresh() {
        let clock = Arc::new(ManualClock::at(60));
        let (_dir, limiter, _) = limiter(clock.clone()).await;

        limiter.check(1, Some(1)).await.unwrap();
        assert!(limiter.check(1, Some(1)).await.is_err());

        clock.advance(TimeDelta::seconds(59));
        assert!(limiter.check(1, Some(1)).await.is_err());

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(limiter.check(1, Some(1)).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn zero_or_missing_ceiling_is_unlimited() {
        let clock = Arc::new(ManualClock::at(0));
        let (_dir, limiter, counters) = limiter(clock).await;

        for _ in 0..10 {
            assert_eq!(limiter.check(1, Some(0)).await.unwrap().ceiling, None);
            assert_eq!(limiter.check(1, None).await.unwrap().remaining(), None);
        }
        assert!(counters.is_empty());
    }

    #[test]
    fn window_ids_align_to_boundaries() {
        let ctx_window = |secs| {
            let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
            RateLimiter {
                counters,
                clock: Arc::new(ManualClock::at(0)),
                window: Duration::from_secs(secs),
                timeout: Duration::from_secs(1),
            }
        };
        let minute = ctx_window(60);
        assert_eq!(minute.counter_key(5, 59), "rl:5:0");
        assert_eq!(minute.counter_key(5, 60), "rl:5:1");
        // A zero window is clamped to one second.
        assert_eq!(ctx_window(0).counter_key(5, 42), "rl:5:42");
    }
}
