//! Outbox dispatcher.
//!
//! A drain cycle runs passes until nothing more can be sent. Each pass claims
//! at most `max_concurrency` eligible items, sends them concurrently and
//! applies every outcome under the database write lock as it arrives.
//! Acknowledging a parent unblocks its children, which the next pass picks
//! up. Every item is attempted at most once per cycle.

use crate::auth::TokenProvider;
use crate::sync::{SyncConfig, SyncEvent};
use crate::transport::{classify, Backend, HttpRequest, Outcome, TransportError};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::{now_millis, ErrorClass, ItemId};
use tandem_store::{OutboxItem, Precheck, RetryDecision, SnapshotWrite, StoreError, SyncDatabase};
use tokio::sync::{broadcast, Mutex};

/// What one drain cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests that went on the wire.
    pub sent: usize,
    pub acknowledged: usize,
    /// Acknowledgements that were replays of an earlier attempt.
    pub duplicates: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Claimed items pushed back without being sent.
    pub deferred: usize,
    /// Dispatch is halted waiting for re-authentication.
    pub halted: bool,
    pub passes: usize,
    /// Items left in the outbox afterwards.
    pub pending: usize,
}

impl DrainReport {
    fn record(&mut self, dispatched: Dispatched) {
        match dispatched {
            Dispatched::Acknowledged { duplicate } => {
                self.sent += 1;
                self.acknowledged += 1;
                if duplicate {
                    self.duplicates += 1;
                }
            }
            Dispatched::Retrying => {
                self.sent += 1;
                self.retrying += 1;
            }
            Dispatched::Failed => {
                self.sent += 1;
                self.failed += 1;
            }
            Dispatched::Halted => {
                self.sent += 1;
                self.halted = true;
            }
            Dispatched::Deferred => self.deferred += 1,
            Dispatched::Skipped => {}
        }
    }
}

/// Write a snapshot on the blocking pool, off the database lock.
pub(crate) async fn write_snapshot(write: SnapshotWrite) -> tandem_store::Result<()> {
    match tokio::task::spawn_blocking(move || write.commit()).await {
        Ok(result) => result.map(|_| ()),
        Err(e) => Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
    }
}

/// Result of dispatching a single claimed item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dispatched {
    Acknowledged { duplicate: bool },
    Retrying,
    Failed,
    /// Rejected with 401; the item went back to the queue.
    Halted,
    Deferred,
    Skipped,
}

pub struct Dispatcher {
    db: Arc<RwLock<SyncDatabase>>,
    backend: Arc<dyn Backend>,
    tokens: Arc<dyn TokenProvider>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    halted: AtomicBool,
    cycle: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<RwLock<SyncDatabase>>,
        backend: Arc<dyn Backend>,
        tokens: Arc<dyn TokenProvider>,
        config: SyncConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            db,
            backend,
            tokens,
            config,
            events,
            halted: AtomicBool::new(false),
            cycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop dispatching. Returns `true` if this call halted it.
    pub fn halt(&self) -> bool {
        let newly = !self.halted.swap(true, Ordering::SeqCst);
        if newly {
            tracing::warn!("dispatch halted: authentication required");
        }
        newly
    }

    /// Allow dispatching again, e.g. after the user signed back in.
    pub fn resume(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            tracing::info!("dispatch resumed");
        }
    }

    /// Run one drain cycle. Concurrent callers wait for the running cycle and
    /// then run their own.
    pub async fn drain(&self) -> DrainReport {
        let _cycle = self.cycle.lock().await;
        let mut report = DrainReport::default();
        let mut attempted: HashSet<ItemId> = HashSet::new();
        let limit = self.config.max_concurrency.max(1);

        loop {
            if self.is_halted() {
                report.halted = true;
                break;
            }
            let Some(token) = self.tokens.bearer_token().await else {
                if self.halt() {
                    self.emit(SyncEvent::AuthRequired);
                }
                report.halted = true;
                break;
            };

            let batch = self.db.write().claim_batch(now_millis(), limit, &attempted);
            if batch.is_empty() {
                break;
            }
            report.passes += 1;
            attempted.extend(batch.iter().map(|item| item.id));
            tracing::trace!(pass = report.passes, batch = batch.len(), "dispatch pass");

            // Batches never exceed `limit`, which bounds the requests in flight.
            let mut in_flight: FuturesUnordered<_> = batch
                .into_iter()
                .map(|item| self.dispatch_one(item, &token))
                .collect();
            while let Some(dispatched) = in_flight.next().await {
                report.record(dispatched);
            }
        }

        let (pending, failed) = {
            let db = self.db.read();
            (db.pending_count(), db.failed_count())
        };
        report.pending = pending;
        if report.sent > 0 || report.deferred > 0 {
            tracing::debug!(
                sent = report.sent,
                acknowledged = report.acknowledged,
                retrying = report.retrying,
                failed = report.failed,
                pending,
                "drain cycle finished"
            );
            self.emit(SyncEvent::PendingChanged { pending });
        }
        self.emit(SyncEvent::DrainCompleted {
            sent: report.sent,
            pending,
            failed,
        });
        report
    }

    async fn dispatch_one(&self, item: OutboxItem, token: &str) -> Dispatched {
        let precheck = self.db.write().precheck(&item.id);
        let item = match precheck {
            Precheck::Ready(item) => item,
            Precheck::Cancelled => return Dispatched::Skipped,
            Precheck::Deferred(_) => return Dispatched::Deferred,
        };
        if self.is_halted() {
            self.db.write().requeue(&item.id);
            return Dispatched::Deferred;
        }

        let request = HttpRequest::from_item(&item, token);
        tracing::debug!(
            item = %item.id,
            method = %item.method,
            url = %request.url,
            attempt = item.retry_count + 1,
            "dispatching"
        );
        let result = match tokio::time::timeout(self.config.request_timeout(), self.backend.execute(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        let outcome = classify(item.method, &result);

        let now = now_millis();
        let mut events = Vec::new();
        let (dispatched, prepared) = {
            let mut db = self.db.write();
            let dispatched = self.apply_outcome(&mut *db, &item, outcome, now, &mut events);
            (dispatched, db.prepare_persist(now))
        };
        let written = match prepared {
            Ok(Some(write)) => write_snapshot(write).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "failed to persist sync state");
        }

        if dispatched == Dispatched::Halted {
            self.tokens.invalidate().await;
        }
        for event in events {
            self.emit(event);
        }
        dispatched
    }

    fn apply_outcome(
        &self,
        db: &mut SyncDatabase,
        item: &OutboxItem,
        outcome: Outcome,
        now: u64,
        events: &mut Vec<SyncEvent>,
    ) -> Dispatched {
        match outcome {
            Outcome::Acknowledged { remote, duplicate } => match db.apply_success(&item.id, remote, now) {
                Ok(ack) => {
                    if let Some((local, remote)) = ack.resolved {
                        events.push(SyncEvent::EntityResolved { local, remote });
                    }
                    events.push(SyncEvent::ItemAcknowledged {
                        item: item.id,
                        duplicate,
                    });
                    Dispatched::Acknowledged { duplicate }
                }
                Err(e) => self.fail(db, item, ErrorClass::ValidationPermanent, e.to_string(), events),
            },
            Outcome::Failed {
                class: ErrorClass::AuthExpired,
                ..
            } => {
                db.requeue(&item.id);
                if self.halt() {
                    events.push(SyncEvent::AuthRequired);
                }
                Dispatched::Halted
            }
            Outcome::Failed { class, reason } if class.is_retryable() => {
                let backoff = self.config.backoff();
                match db.apply_transient(&item.id, reason.as_str(), &backoff, self.config.max_retries, now) {
                    Ok(RetryDecision::Scheduled { attempt, next_retry_at }) => {
                        events.push(SyncEvent::RetryScheduled {
                            item: item.id,
                            attempt,
                            next_retry_at,
                        });
                        Dispatched::Retrying
                    }
                    Ok(RetryDecision::Exhausted { .. }) => {
                        events.push(SyncEvent::ItemFailed {
                            item: item.id,
                            class,
                            error: reason,
                        });
                        Dispatched::Failed
                    }
                    Err(e) => {
                        tracing::warn!(item = %item.id, error = %e, "could not record transient failure");
                        Dispatched::Skipped
                    }
                }
            }
            Outcome::Failed { class, reason } => self.fail(db, item, class, reason, events),
        }
    }

    fn fail(
        &self,
        db: &mut SyncDatabase,
        item: &OutboxItem,
        class: ErrorClass,
        reason: String,
        events: &mut Vec<SyncEvent>,
    ) -> Dispatched {
        match db.apply_permanent(&item.id, reason.as_str()) {
            Ok(()) => {
                events.push(SyncEvent::ItemFailed {
                    item: item.id,
                    class,
                    error: reason,
                });
                Dispatched::Failed
            }
            Err(e) => {
                tracing::warn!(item = %item.id, error = %e, "could not record permanent failure");
                Dispatched::Skipped
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::memory::{Fault, MemoryBackend};
    use crate::sync::SyncConfigBuilder;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tandem_core::{EntityKind, SyncStatus};
    use tandem_store::{ResourceRegistry, ResourceSpec};

    fn fixture(config: SyncConfig) -> (Arc<RwLock<SyncDatabase>>, Arc<MemoryBackend>, Dispatcher) {
        let resources = ResourceRegistry::new()
            .with(ResourceSpec::new("schedules", "/schedules"))
            .with(ResourceSpec::new("exercises", "/schedules/{schedule_id}/exercises"));
        let db = Arc::new(RwLock::new(SyncDatabase::new(resources, config.dedup_window_ms)));
        let backend = Arc::new(MemoryBackend::new());
        let (events, _) = broadcast::channel(64);
        let dispatcher = Dispatcher::new(
            db.clone(),
            backend.clone(),
            Arc::new(StaticToken::new("token")),
            config,
            events,
        );
        (db, backend, dispatcher)
    }

    fn fields(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_drain_sends_parent_then_child() {
        let (db, backend, dispatcher) = fixture(SyncConfig::default());
        let (schedule, exercise) = {
            let mut db = db.write();
            let schedule = db
                .create_entity(EntityKind::new("schedules"), fields(json!({"name": "Push"})), BTreeMap::new(), 1)
                .unwrap();
            let refs = BTreeMap::from([("schedule_id".to_string(), schedule)]);
            let exercise = db
                .create_entity(EntityKind::new("exercises"), fields(json!({"name": "Bench"})), refs, 2)
                .unwrap();
            (schedule, exercise)
        };

        let report = dispatcher.drain().await;
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.passes, 2);
        assert_eq!(report.pending, 0);
        assert_eq!(backend.request_count(), 2);

        let db = db.read();
        let parent_remote = db.get(&schedule).unwrap().remote_id().cloned().unwrap();
        assert_eq!(db.get(&exercise).unwrap().sync_status, SyncStatus::Synced);
        let requests = backend.requests();
        assert_eq!(requests[1].url, format!("/schedules/{}/exercises", parent_remote));
    }

    #[tokio::test]
    async fn test_server_error_schedules_retry() {
        let config = SyncConfigBuilder::new().backoff(60_000, 60_000).build();
        let (db, backend, dispatcher) = fixture(config);
        let mut events = dispatcher.events.subscribe();
        db.write()
            .create_entity(EntityKind::new("schedules"), fields(json!({"name": "Pull"})), BTreeMap::new(), 1)
            .unwrap();
        backend.inject(Fault::Status(503));

        let report = dispatcher.drain().await;
        assert_eq!(report.retrying, 1);
        assert_eq!(report.pending, 1);
        let failed_item = db.read().outbox().items()[0].clone();
        assert_eq!(failed_item.retry_count, 1);
        assert!(failed_item.last_error.as_deref().unwrap().contains("503"));

        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::RetryScheduled { attempt: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_halts_without_consuming_retry() {
        let (db, backend, dispatcher) = fixture(SyncConfig::default());
        db.write()
            .create_entity(EntityKind::new("schedules"), fields(json!({"name": "Legs"})), BTreeMap::new(), 1)
            .unwrap();
        backend.require_token("other");

        let report = dispatcher.drain().await;
        assert!(report.halted);
        assert!(dispatcher.is_halted());
        let item = db.read().outbox().items()[0].clone();
        assert_eq!(item.retry_count, 0);

        // Halted: nothing goes out until resumed.
        let report = dispatcher.drain().await;
        assert_eq!(report.sent, 0);

        backend.accept_any_token();
        dispatcher.resume();
        let report = dispatcher.drain().await;
        assert_eq!(report.acknowledged, 1);
        assert_eq!(db.read().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_token_halts_before_sending() {
        let (db, backend, _) = fixture(SyncConfig::default());
        let (events, _) = broadcast::channel(8);
        let dispatcher = Dispatcher::new(
            db.clone(),
            backend.clone(),
            Arc::new(StaticToken::signed_out()),
            SyncConfig::default(),
            events,
        );
        db.write()
            .create_entity(EntityKind::new("schedules"), fields(json!({"name": "Core"})), BTreeMap::new(), 1)
            .unwrap();

        let report = dispatcher.drain().await;
        assert!(report.halted);
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_error_fails_item() {
        let (db, backend, dispatcher) = fixture(SyncConfig::default());
        db.write()
            .create_entity(EntityKind::new("schedules"), fields(json!({"name": ""})), BTreeMap::new(), 1)
            .unwrap();
        backend.inject(Fault::Status(422));

        let report = dispatcher.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(db.read().failed_count(), 1);

        // Failed items are not retried automatically.
        let report = dispatcher.drain().await;
        assert_eq!(report.sent, 0);
    }
}
