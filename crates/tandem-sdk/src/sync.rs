//! Sync configuration, events and the background sync loop.

use crate::dispatcher::Dispatcher;
use crate::error::SdkError;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::backoff::{DEFAULT_BASE_MS, DEFAULT_CAP_MS};
use tandem_core::{BackoffPolicy, ErrorClass, ItemId, LocalId, RemoteId};
use tandem_store::DEFAULT_DEDUP_WINDOW_MS;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Configuration for sync behavior.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How often the background loop drains the outbox (in milliseconds).
    pub sync_interval_ms: u64,
    /// Maximum number of requests in flight at once.
    pub max_concurrency: usize,
    /// Identical payloads enqueued within this window are dropped.
    pub dedup_window_ms: u64,
    /// First retry delay (in milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay (in milliseconds).
    pub backoff_cap_ms: u64,
    /// Transient failures tolerated before an item is marked failed.
    pub max_retries: u32,
    /// Per-request timeout (in milliseconds).
    pub request_timeout_ms: u64,
    /// Enable automatic background sync.
    pub auto_sync: bool,
    /// Snapshot file; `None` keeps everything in memory.
    pub persist_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base_ms, self.backoff_cap_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5000,
            max_concurrency: 4,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            backoff_base_ms: DEFAULT_BASE_MS,
            backoff_cap_ms: DEFAULT_CAP_MS,
            max_retries: 8,
            request_timeout_ms: 30_000,
            auto_sync: true,
            persist_path: None,
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn sync_interval(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n.max(1);
        self
    }

    pub fn dedup_window(mut self, ms: u64) -> Self {
        self.config.dedup_window_ms = ms;
        self
    }

    pub fn backoff(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.config.backoff_base_ms = base_ms;
        self.config.backoff_cap_ms = cap_ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn request_timeout(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.persist_path = Some(path.into());
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted while syncing.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// The number of unacknowledged items changed.
    PendingChanged { pending: usize },
    /// The server assigned an id to a local entity.
    EntityResolved { local: LocalId, remote: RemoteId },
    /// An item was acknowledged (possibly as a replay of an earlier attempt).
    ItemAcknowledged { item: ItemId, duplicate: bool },
    /// A transient failure; the item will be retried.
    RetryScheduled {
        item: ItemId,
        attempt: u32,
        next_retry_at: u64,
    },
    /// The item failed for good and needs attention.
    ItemFailed {
        item: ItemId,
        class: ErrorClass,
        error: String,
    },
    /// The backend rejected the token; dispatch is halted until resumed.
    AuthRequired,
    /// A drain cycle finished.
    DrainCompleted { sent: usize, pending: usize, failed: usize },
}

/// Runs drain cycles in the background on an interval and on demand.
pub struct SyncManager {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    wake: Arc<Notify>,
    task: Mutex<Option<(JoinHandle<()>, oneshot::Sender<()>)>>,
}

impl SyncManager {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Spawn the background loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), SdkError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(SdkError::AlreadyRunning);
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let dispatcher = self.dispatcher.clone();
        let wake = self.wake.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            tracing::debug!("background sync started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                dispatcher.drain().await;
            }
            tracing::debug!("background sync stopped");
        });

        *task = Some((handle, stop_tx));
        Ok(())
    }

    /// Ask the loop to drain now instead of at the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop the loop, letting an in-progress drain cycle finish.
    pub async fn stop(&self) -> Result<(), SdkError> {
        let Some((handle, stop_tx)) = self.task.lock().take() else {
            return Err(SdkError::NotRunning);
        };
        let _ = stop_tx.send(());
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background sync task ended abnormally");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::memory::MemoryBackend;
    use tandem_store::{ResourceRegistry, SyncDatabase};

    #[test]
    fn test_sync_config_builder() {
        let config = SyncConfigBuilder::new()
            .sync_interval(500)
            .max_concurrency(0)
            .dedup_window(250)
            .backoff(10, 80)
            .max_retries(3)
            .request_timeout(3000)
            .auto_sync(false)
            .persist_to("/tmp/tandem.json")
            .build();

        assert_eq!(config.sync_interval_ms, 500);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.dedup_window_ms, 250);
        assert_eq!(config.backoff(), BackoffPolicy::new(10, 80));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert!(!config.auto_sync);
        assert_eq!(config.persist_path, Some(PathBuf::from("/tmp/tandem.json")));
    }

    #[test]
    fn test_default_backoff_matches_policy_default() {
        assert_eq!(SyncConfig::default().backoff(), BackoffPolicy::default());
    }

    #[tokio::test]
    async fn test_sync_manager_start_stop() {
        let db = Arc::new(parking_lot::RwLock::new(SyncDatabase::new(ResourceRegistry::new(), 0)));
        let (events, _) = tokio::sync::broadcast::channel(16);
        let dispatcher = Arc::new(Dispatcher::new(
            db,
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticToken::new("t")),
            SyncConfig::default(),
            events,
        ));
        let manager = SyncManager::new(dispatcher, Duration::from_millis(10));

        assert!(matches!(manager.stop().await, Err(SdkError::NotRunning)));
        manager.start().unwrap();
        assert!(manager.is_running());
        assert!(matches!(manager.start(), Err(SdkError::AlreadyRunning)));

        manager.wake();
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }
}
