//! The handle an application holds for the lifetime of a signed-in session.

use crate::auth::TokenProvider;
use crate::dispatcher::{write_snapshot, DrainReport, Dispatcher};
use crate::error::{Result, SdkError};
use crate::sync::{SyncConfig, SyncEvent, SyncManager};
use crate::transport::Backend;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::{now_millis, EntityKind, EntityRecord, ItemId, LocalId, RemoteId};
use tandem_store::{
    CascadeReport, Enqueued, OutboundRequest, OutboxItem, ResourceRegistry, SnapshotWrite, SyncDatabase,
};
use tokio::sync::broadcast;

/// Local-first access to entities plus the machinery that syncs them.
///
/// Mutations return as soon as the local write is done; the network is only
/// touched by drain cycles, either on demand through [`Session::sync_now`] or
/// from the background loop.
pub struct Session {
    db: Arc<RwLock<SyncDatabase>>,
    dispatcher: Arc<Dispatcher>,
    manager: SyncManager,
    event_tx: broadcast::Sender<SyncEvent>,
    closed: AtomicBool,
}

impl Session {
    /// Open a session, loading persisted state when `persist_path` is set.
    /// Starts the background loop when `auto_sync` is enabled.
    pub async fn open(
        config: SyncConfig,
        resources: ResourceRegistry,
        backend: Arc<dyn Backend>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let db = match &config.persist_path {
            Some(path) => SyncDatabase::open(path.clone(), resources, config.dedup_window_ms)?,
            None => SyncDatabase::new(resources, config.dedup_window_ms),
        };
        let db = Arc::new(RwLock::new(db));
        let (event_tx, _) = broadcast::channel(256);

        let auto_sync = config.auto_sync;
        let interval = config.sync_interval();
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), backend, tokens, config, event_tx.clone()));
        let manager = SyncManager::new(dispatcher.clone(), interval);

        let session = Self {
            db,
            dispatcher,
            manager,
            event_tx,
            closed: AtomicBool::new(false),
        };
        if auto_sync {
            session.manager.start()?;
        }
        Ok(session)
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        self.dispatcher.config()
    }

    // ---- local mutations ----

    /// Create an entity. `refs` name its parents by local id.
    pub fn create(
        &self,
        kind: impl Into<EntityKind>,
        fields: Value,
        refs: &[(&str, LocalId)],
    ) -> Result<LocalId> {
        let kind = kind.into();
        let fields = into_object(fields)?;
        let refs: BTreeMap<String, LocalId> = refs.iter().map(|(name, id)| (name.to_string(), *id)).collect();
        self.mutate(|db, now| db.create_entity(kind, fields, refs, now))
    }

    /// Merge `patch` into the entity's fields.
    pub fn update(&self, id: &LocalId, patch: Value) -> Result<ItemId> {
        let patch = into_object(patch)?;
        self.mutate(|db, now| db.update_entity(id, patch, now))
    }

    /// Delete the entity and everything below it.
    pub fn delete(&self, id: &LocalId) -> Result<CascadeReport> {
        self.mutate(|db, now| db.delete_entity(id, now))
    }

    /// Enqueue a request that is not tied to an entity kind.
    pub fn enqueue(&self, request: OutboundRequest) -> Result<Enqueued> {
        self.mutate(|db, now| Ok(db.enqueue(request, now)))
    }

    /// Put a failed item back in the queue.
    pub fn retry_failed(&self, item: &ItemId) -> Result<()> {
        self.mutate(|db, _| db.retry_failed(item))
    }

    /// Give up on a failed item.
    pub fn discard_failed(&self, item: &ItemId) -> Result<CascadeReport> {
        self.mutate(|db, now| db.discard_failed(item, now))
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut SyncDatabase, u64) -> tandem_store::Result<T>) -> Result<T> {
        self.ensure_open()?;
        let now = now_millis();
        let (value, pending, prepared) = {
            let mut db = self.db.write();
            let value = op(&mut *db, now)?;
            (value, db.pending_count(), db.prepare_persist(now))
        };
        // Written after the lock is released.
        if let Err(e) = prepared.and_then(|write| write.map_or(Ok(true), SnapshotWrite::commit)) {
            tracing::error!(error = %e, "failed to persist sync state");
        }
        let _ = self.event_tx.send(SyncEvent::PendingChanged { pending });
        self.manager.wake();
        Ok(value)
    }

    // ---- reads ----

    pub fn get(&self, id: &LocalId) -> Option<EntityRecord> {
        self.db.read().get(id).cloned()
    }

    pub fn get_by_remote(&self, remote: &RemoteId) -> Option<EntityRecord> {
        self.db.read().store().get_by_remote(remote).cloned()
    }

    /// Live records of one kind, oldest first.
    pub fn list(&self, kind: &EntityKind) -> Vec<EntityRecord> {
        self.db
            .read()
            .store()
            .iter()
            .filter(|record| &record.kind == kind && !record.is_deleted())
            .cloned()
            .collect()
    }

    /// Items still on their way to the server. Failed items are counted by
    /// [`Session::failed_count`].
    pub fn pending_count(&self) -> usize {
        self.db.read().pending_count()
    }

    pub fn failed_count(&self) -> usize {
        self.db.read().failed_count()
    }

    pub fn failed_items(&self) -> Vec<OutboxItem> {
        self.db.read().failed_items()
    }

    pub fn outbox_items(&self) -> Vec<OutboxItem> {
        self.db.read().outbox().items()
    }

    // ---- sync control ----

    /// Run a drain cycle now and wait for it.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.ensure_open()?;
        Ok(self.dispatcher.drain().await)
    }

    pub fn start_background(&self) -> Result<()> {
        self.ensure_open()?;
        self.manager.start()
    }

    pub async fn stop_background(&self) -> Result<()> {
        self.manager.stop().await
    }

    pub fn is_background_running(&self) -> bool {
        self.manager.is_running()
    }

    /// Dispatch is halted after a 401 or a missing token.
    pub fn is_halted(&self) -> bool {
        self.dispatcher.is_halted()
    }

    /// Call once a fresh token is available.
    pub fn resume_after_reauth(&self) {
        self.dispatcher.resume();
        self.manager.wake();
    }

    /// Stop syncing and write the final state. Queued items survive in the
    /// snapshot and go out when the next session starts.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SdkError::Closed);
        }
        if self.manager.is_running() {
            self.manager.stop().await?;
        }
        let (prepared, pending) = {
            let mut db = self.db.write();
            (db.prepare_persist(now_millis())?, db.pending_count())
        };
        if let Some(write) = prepared {
            write_snapshot(write).await?;
        }
        tracing::info!(pending, "session closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SdkError::Closed);
        }
        Ok(())
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SdkError::InvalidPayload(format!("expected a JSON object, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::memory::MemoryBackend;
    use crate::sync::SyncConfigBuilder;
    use serde_json::json;
    use tandem_core::SyncStatus;
    use tandem_store::ResourceSpec;

    async fn session(backend: Arc<MemoryBackend>) -> Session {
        let resources = ResourceRegistry::new().with(ResourceSpec::new("notes", "/notes"));
        let config = SyncConfigBuilder::new().auto_sync(false).build();
        Session::open(config, resources, backend, Arc::new(StaticToken::new("t")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_write_is_immediately_readable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_offline(true);
        let session = session(backend.clone()).await;

        let id = session.create("notes", json!({"text": "hi"}), &[]).unwrap();
        let record = session.get(&id).unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.fields["text"], "hi");
        assert_eq!(session.pending_count(), 1);
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_non_object_payloads() {
        let session = session(Arc::new(MemoryBackend::new())).await;
        assert!(matches!(
            session.create("notes", json!([1, 2]), &[]),
            Err(SdkError::InvalidPayload(_))
        ));
        let id = session.create("notes", json!({}), &[]).unwrap();
        assert!(matches!(session.update(&id, json!("x")), Err(SdkError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_mutation_emits_pending_changed() {
        let session = session(Arc::new(MemoryBackend::new())).await;
        let mut events = session.subscribe();
        session.create("notes", json!({"text": "a"}), &[]).unwrap();
        assert_eq!(events.recv().await.unwrap(), SyncEvent::PendingChanged { pending: 1 });
    }

    #[tokio::test]
    async fn test_sync_resolves_by_remote_id() {
        let backend = Arc::new(MemoryBackend::new());
        let session = session(backend.clone()).await;
        let id = session.create("notes", json!({"text": "a"}), &[]).unwrap();

        let report = session.sync_now().await.unwrap();
        assert_eq!(report.acknowledged, 1);

        let remote = session.get(&id).unwrap().remote_id().cloned().unwrap();
        assert_eq!(session.get_by_remote(&remote).map(|record| record.id()), Some(id));
        assert_eq!(session.list(&EntityKind::new("notes")).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let session = session(Arc::new(MemoryBackend::new())).await;
        session.close().await.unwrap();
        assert!(matches!(session.create("notes", json!({}), &[]), Err(SdkError::Closed)));
        assert!(matches!(session.sync_now().await, Err(SdkError::Closed)));
        assert!(matches!(session.close().await, Err(SdkError::Closed)));
    }
}
