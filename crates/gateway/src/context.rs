//! Start-up wiring: every component is built from one [`Context`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api_key::KeyMinter;
use async_trait::async_trait;
use pingora::services::background::BackgroundService;
use tokio_util::task::TaskTracker;

use crate::clock::{Clock, SystemClock};
use crate::configuration::{CounterBackend, GatewayConfig};
use crate::counter::{CounterStore, MemoryCounterStore};
use crate::error::StoreError;
use crate::store::SqliteStore;

/// Detached side effects (usage records, last-used stamps).
///
/// Each task runs under its own deadline and never reports back to the
/// request that spawned it. [`BackgroundTasks::drain`] waits for the ones in
/// flight, which is what shutdown uses.
#[derive(Clone, Debug)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    timeout: Duration,
}

impl BackgroundTasks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            timeout,
        }
    }

    pub fn spawn<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let timeout = self.timeout;
        self.tracker.spawn(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("background {label} failed: {e}"),
                Err(_) => log::warn!("background {label} timed out after {timeout:?}"),
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every task spawned so far. New tasks may be spawned afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Waits for detached tasks once the server starts shutting down.
pub struct TaskDrain {
    tasks: BackgroundTasks,
}

impl TaskDrain {
    pub fn new(tasks: BackgroundTasks) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl BackgroundService for TaskDrain {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
        let pending = self.tasks.in_flight();
        if pending > 0 {
            log::info!("Waiting for {pending} background tasks before shutdown");
        }
        self.tasks.drain().await;
        log::info!("Background tasks drained");
    }
}

/// Shared dependencies handed to each component at construction.
#[derive(Clone)]
pub struct Context {
    pub store: SqliteStore,
    pub counters: Arc<dyn CounterStore>,
    pub clock: Arc<dyn Clock>,
    pub minter: KeyMinter,
    pub background: BackgroundTasks,
    /// Per-call deadline for store and counter operations.
    pub store_timeout: Duration,
    /// Fixed rate-limit window length.
    pub rate_window: Duration,
}

impl Context {
    /// Defaults suitable for tests and the admin tool: in-memory counters,
    /// system clock, a 60 second window.
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            counters: Arc::new(MemoryCounterStore::new()),
            clock: Arc::new(SystemClock),
            minter: KeyMinter::default(),
            background: BackgroundTasks::new(Duration::from_secs(5)),
            store_timeout: Duration::from_secs(2),
            rate_window: Duration::from_secs(60),
        }
    }

    /// Build from validated configuration. Initializes the schema.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, StoreError> {
        let store_timeout = Duration::from_millis(config.timeouts.store_ms);
        let store = SqliteStore::new(&config.database).with_busy_timeout(store_timeout);
        store.init_blocking()?;

        let counters: Arc<dyn CounterStore> = match &config.rate_limit.store {
            CounterBackend::Memory => Arc::new(MemoryCounterStore::new()),
            #[cfg(feature = "redis-counters")]
            CounterBackend::Redis { url } => {
                Arc::new(crate::counter::RedisCounterStore::open(url, "gateway")?)
            }
            #[cfg(not(feature = "redis-counters"))]
            CounterBackend::Redis { .. } => {
                log::warn!("redis counters not compiled in, using in-memory counters");
                Arc::new(MemoryCounterStore::new())
            }
        };

        let mut minter = KeyMinter::new(config.key_prefix.clone());
        if let Some(context) = config.key_context {
            minter = minter.with_context(context);
        }

        Ok(Self {
            store,
            counters,
            clock: Arc::new(SystemClock),
            minter,
            background: BackgroundTasks::new(Duration::from_millis(config.timeouts.background_ms)),
            store_timeout,
            rate_window: Duration::from_secs(config.rate_limit.window_secs),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}
