//! Shared counters with expiry, the backing store for rate limiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pingora::services::background::BackgroundService;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::metric::Metrics;

/// How long per-minute outcome counters are kept.
const METRICS_RETENTION_MINUTES: i64 = 60;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key` and return the new count.
    ///
    /// The first increment of a key sets its time to live; later increments
    /// leave the expiry alone.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Drop expired entries. Stores that expire keys themselves return 0.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Process-local counters for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn incr_at(&self, key: &str, ttl: Duration, now: Instant) -> u64 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        entry.0
    }

    fn purge_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self.incr_at(key, ttl, Instant::now()))
    }

    fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }
}

/// Periodically drops expired counters and old outcome buckets.
pub struct CounterSweeper {
    counters: Arc<dyn CounterStore>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl CounterSweeper {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            counters,
            metrics,
            clock,
            interval,
        }
    }

    pub fn sweep(&self) -> usize {
        let counters = self.counters.purge_expired();
        let cutoff = self.clock.unix_secs().div_euclid(60) - METRICS_RETENTION_MINUTES;
        let buckets = self.metrics.prune(cutoff);
        if counters + buckets > 0 {
            log::debug!("swept {counters} expired counters and {buckets} metric buckets");
        }
        counters + buckets
    }
}

#[async_trait]
impl BackgroundService for CounterSweeper {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep();
                }
            }
        }
    }
}

#[cfg(feature = "redis-counters")]
pub use self::redis_counters::RedisCounterStore;

#[cfg(feature = "redis-counters")]
mod redis_counters {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    /// INCR and, on the first hit of a key, EXPIRE in one server-side step.
    const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
  redis.call("EXPIRE", KEYS[1], tonumber(ARGV[1]))
end
return count
"#;

    /// Counters shared by every gateway instance pointing at one Redis.
    #[derive(Clone)]
    pub struct RedisCounterStore {
        client: redis::Client,
        prefix: String,
        script: redis::Script,
        /// Shared by every call; dropped after a connection error.
        conn: Arc<AsyncMutex<Option<redis::aio::MultiplexedConnection>>>,
    }

    impl std::fmt::Debug for RedisCounterStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisCounterStore")
                .field("prefix", &self.prefix)
                .finish_non_exhaustive()
        }
    }

    impl RedisCounterStore {
        /// Parses the URL only; the connection is made on first use.
        pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
            Ok(Self {
                client: redis::Client::open(url)?,
                prefix: prefix.into(),
                script: redis::Script::new(INCR_WITH_EXPIRY_SCRIPT),
                conn: Arc::new(AsyncMutex::new(None)),
            })
        }

        fn prefixed(&self, key: &str) -> String {
            format!("{}:{key}", self.prefix)
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
            let mut slot = self.conn.lock().await;
            if let Some(conn) = slot.as_ref() {
                return Ok(conn.clone());
            }
            let conn = self.client.get_multiplexed_async_connection().await?;
            *slot = Some(conn.clone());
            Ok(conn)
        }

        async fn forget_connection(&self) {
            self.conn.lock().await.take();
        }
    }

    #[async_trait]
    impl CounterStore for RedisCounterStore {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
            let mut conn = self.connection().await?;
            let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
            let result: Result<u64, redis::RedisError> = self
                .script
                .key(self.prefixed(key))
                .arg(secs)
                .invoke_async(&mut conn)
                .await;
            match result {
                Ok(count) => Ok(count),
                Err(e) => {
                    if e.is_connection_dropped() || e.is_io_error() {
                        log::warn!("redis connection lost, reconnecting on next call: {e}");
                        self.forget_connection().await;
                    }
                    Err(e.into())
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_per_key() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry("a", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("a", ttl).await.unwrap(), 2);
        assert_eq!(store.incr_with_expiry("b", ttl).await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn expired_entries_restart_and_purge() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(10);
        let t0 = Instant::now();

        assert_eq!(store.incr_at("k", ttl, t0), 1);
        assert_eq!(store.incr_at("k", ttl, t0 + Duration::from_secs(5)), 2);
        // Expiry is set on first increment only.
        assert_eq!(store.incr_at("k", ttl, t0 + Duration::from_secs(10)), 1);

        store.incr_at("other", ttl, t0);
        assert_eq!(store.purge_at(t0 + Duration::from_secs(11)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_at(t0 + Duration::from_secs(60)), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sweeper_purges_counters_and_old_metrics() {
        let store = Arc::new(MemoryCounterStore::new());
        store.incr_at("gone", Duration::from_secs(1), Instant::now() - Duration::from_secs(5));
        store.incr_at("kept", Duration::from_secs(60), Instant::now());

        let metrics = Arc::new(Metrics::new());
        metrics.record(crate::metric::Subject::Account(1), 200, 0);
        metrics.record(crate::metric::Subject::Account(1), 200, 10_000);

        let clock = Arc::new(crate::clock::ManualClock::at(10_000));
        let sweeper = CounterSweeper::new(store.clone(), metrics.clone(), clock, Duration::from_secs(1));
        assert_eq!(sweeper.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(metrics.snapshot(crate::metric::Subject::Account(1)).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .incr_with_expiry("hot", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
    }
}
