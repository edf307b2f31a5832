//! Sync database - the store, the outbox and the resource routes behind one
//! handle.
//!
//! Every method is one atomic transition: callers hold a single write lock
//! around it, so an identity/status pair and the outbox items that depend on
//! it are never observed half-updated.

use crate::cascade::{CascadeHandler, CascadeReport};
use crate::entity_store::LocalStore;
use crate::error::{Result, StoreError};
use crate::outbox::{Enqueued, ItemState, Operation, OutboundRequest, Outbox, OutboxItem};
use crate::resolver::{unresolved_placeholders, IdentifierResolver};
use crate::resource::ResourceRegistry;
use crate::snapshot::{SnapshotWrite, StoreSnapshot};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_core::{BackoffPolicy, EntityKind, EntityRecord, ItemId, LocalId, RemoteId};

/// State of a claimed item right before it goes on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Precheck {
    Ready(OutboxItem),
    /// Removed or no longer claimed since the batch was taken.
    Cancelled,
    /// Placeholders remain; pushed back to `Queued`.
    Deferred(BTreeSet<LocalId>),
}

/// Effects of an acknowledged item.
#[derive(Clone, Debug, PartialEq)]
pub struct Acknowledged {
    pub item: OutboxItem,
    /// The entity whose remote id became known.
    pub resolved: Option<(LocalId, RemoteId)>,
    /// Dependents rewritten with the new remote id.
    pub rewritten: Vec<ItemId>,
    /// Delete enqueued for an entity removed while its create was in flight.
    pub follow_up: Option<ItemId>,
    /// Tombstone dropped after its delete was done.
    pub removed: Option<LocalId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, next_retry_at: u64 },
    Exhausted { attempts: u32 },
}

#[derive(Clone, Debug)]
pub struct SyncDatabase {
    store: LocalStore,
    outbox: Outbox,
    resources: ResourceRegistry,
    persist_path: Option<PathBuf>,
    /// Bumped for every snapshot taken for writing.
    generation: u64,
    /// Generation of the snapshot last written to `persist_path`.
    written: Arc<Mutex<u64>>,
}

impl SyncDatabase {
    pub fn new(resources: ResourceRegistry, dedup_window_ms: u64) -> Self {
        Self {
            store: LocalStore::new(),
            outbox: Outbox::new(dedup_window_ms),
            resources,
            persist_path: None,
            generation: 0,
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Open the snapshot at `path` (or start empty) and keep persisting to it.
    pub fn open(path: impl Into<PathBuf>, resources: ResourceRegistry, dedup_window_ms: u64) -> Result<Self> {
        let path = path.into();
        let mut db = match StoreSnapshot::read_from(&path)? {
            Some(snapshot) => Self::from_snapshot(snapshot, resources, dedup_window_ms)?,
            None => Self::new(resources, dedup_window_ms),
        };
        db.persist_path = Some(path);
        Ok(db)
    }

    pub fn from_snapshot(
        snapshot: StoreSnapshot,
        resources: ResourceRegistry,
        dedup_window_ms: u64,
    ) -> Result<Self> {
        let store = LocalStore::from_records(snapshot.entities)?;
        let outbox = Outbox::from_items(snapshot.outbox, dedup_window_ms);
        let mut db = Self {
            store,
            outbox,
            resources,
            persist_path: None,
            generation: 0,
            written: Arc::new(Mutex::new(0)),
        };
        let recovered = db.recover_in_flight();
        tracing::info!(
            entities = db.store.len(),
            items = db.outbox.len(),
            recovered,
            "loaded sync snapshot"
        );
        Ok(db)
    }

    pub fn snapshot(&self, now: u64) -> StoreSnapshot {
        StoreSnapshot::new(self.store.records(), self.outbox.items(), now)
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Serialize the current state for writing, if persistence is
    /// configured. The write itself can happen after the lock is released.
    pub fn prepare_persist(&mut self, now: u64) -> Result<Option<SnapshotWrite>> {
        let Some(path) = self.persist_path.clone() else {
            return Ok(None);
        };
        let bytes = self.snapshot(now).to_bytes()?;
        self.generation += 1;
        Ok(Some(SnapshotWrite::new(path, self.generation, bytes, self.written.clone())))
    }

    /// Write the snapshot now, if persistence is configured.
    pub fn persist(&mut self, now: u64) -> Result<()> {
        if let Some(write) = self.prepare_persist(now)? {
            write.commit()?;
        }
        Ok(())
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn get(&self, id: &LocalId) -> Option<&EntityRecord> {
        self.store.get(id)
    }

    // ---- local mutations ----

    /// Write a pending record and enqueue its create.
    pub fn create_entity(
        &mut self,
        kind: EntityKind,
        fields: Map<String, Value>,
        refs: BTreeMap<String, LocalId>,
        now: u64,
    ) -> Result<LocalId> {
        let spec = self.resources.get(&kind)?;
        let id = self.store.create(kind, fields, refs, now)?;
        let record = self.store.get(&id).ok_or(StoreError::NotFound(id))?;
        let request = spec.create_request(record, &self.store);
        let item = self.outbox.enqueue(request, now).item_id();
        tracing::debug!(entity = %id, item = %item, "created entity");
        Ok(id)
    }

    /// Apply a patch locally and get it to the server, either folded into a
    /// create that was never sent or as its own update. Returns the item
    /// carrying the change.
    pub fn update_entity(&mut self, id: &LocalId, patch: Map<String, Value>, now: u64) -> Result<ItemId> {
        self.store.update(id, &patch, now)?;

        if let Some(create) = self.outbox.unsent_create(id).map(|item| item.id) {
            self.outbox.update(&create, |item| {
                if let Some(Value::Object(body)) = item.body.as_mut() {
                    for (key, value) in &patch {
                        body.insert(key.clone(), value.clone());
                    }
                }
            });
            tracing::debug!(entity = %id, item = %create, "coalesced update into pending create");
            return Ok(create);
        }

        let record = self.store.get(id).ok_or(StoreError::NotFound(*id))?;
        let spec = self.resources.get(&record.kind)?;
        let request = spec.update_request(record, &patch, &self.store);
        Ok(self.outbox.enqueue(request, now).item_id())
    }

    pub fn delete_entity(&mut self, id: &LocalId, now: u64) -> Result<CascadeReport> {
        CascadeHandler::new(&mut self.store, &mut self.outbox, &self.resources, now).delete(id)
    }

    /// Enqueue a caller-built request. Placeholders in it become dependencies.
    pub fn enqueue(&mut self, mut request: OutboundRequest, now: u64) -> Enqueued {
        request
            .dependency_refs
            .extend(unresolved_placeholders(&request.url_template, request.body.as_ref()));
        self.outbox.enqueue(request, now)
    }

    // ---- dispatch ----

    /// Rewrite dependencies whose remote id the store already knows.
    pub fn resolve_known_dependencies(&mut self) -> usize {
        let known: BTreeMap<LocalId, RemoteId> = self
            .outbox
            .iter()
            .filter(|item| item.is_outstanding())
            .flat_map(|item| item.dependency_refs.iter())
            .filter_map(|dep| self.store.remote_id_of(dep).map(|remote| (*dep, remote)))
            .collect();

        known
            .iter()
            .map(|(local, remote)| IdentifierResolver::on_resolved(&mut self.outbox, local, remote).len())
            .sum()
    }

    /// Every entity an item touches: its target, its dependencies and all of
    /// their ancestors.
    fn item_lineage(&self, item: &OutboxItem) -> BTreeSet<LocalId> {
        item.target
            .iter()
            .chain(item.dependency_refs.iter())
            .flat_map(|id| self.store.lineage(id))
            .collect()
    }

    /// Claim up to `limit` eligible items and mark them `Dispatching`.
    ///
    /// An item is eligible when it is queued, not in `exclude`, free of
    /// dependencies and placeholders, and no earlier outstanding item touches
    /// its lineage. Claimed items therefore never share a lineage.
    pub fn claim_batch(&mut self, now: u64, limit: usize, exclude: &HashSet<ItemId>) -> Vec<OutboxItem> {
        let candidates = self.outbox.candidates(now);
        if candidates.is_empty() || limit == 0 {
            return Vec::new();
        }
        self.resolve_known_dependencies();

        let mut busy: BTreeSet<LocalId> = BTreeSet::new();
        let mut eligible: HashSet<ItemId> = HashSet::new();
        for item in self.outbox.iter().filter(|item| item.is_outstanding()) {
            let lineage = self.item_lineage(item);
            if item.state == ItemState::Queued
                && !exclude.contains(&item.id)
                && item.dependency_refs.is_empty()
                && lineage.is_disjoint(&busy)
                && unresolved_placeholders(&item.url_template, item.body.as_ref()).is_empty()
            {
                eligible.insert(item.id);
            }
            busy.extend(lineage);
        }

        let mut claimed = Vec::new();
        for id in candidates.into_iter().filter(|id| eligible.contains(id)) {
            if claimed.len() >= limit {
                break;
            }
            let item = self.outbox.update(&id, |item| {
                item.state = ItemState::Dispatching;
                item.clone()
            });
            if let Some(item) = item {
                claimed.push(item);
            }
        }
        claimed
    }

    /// Re-check a claimed item right before sending it.
    pub fn precheck(&mut self, id: &ItemId) -> Precheck {
        let missing = match self.outbox.get(id) {
            Some(item) if item.state == ItemState::Dispatching => {
                let mut missing = unresolved_placeholders(&item.url_template, item.body.as_ref());
                missing.extend(item.dependency_refs.iter().copied());
                if missing.is_empty() {
                    return Precheck::Ready(item.clone());
                }
                missing
            }
            _ => return Precheck::Cancelled,
        };

        self.requeue(id);
        tracing::debug!(item = %id, unresolved = missing.len(), "deferred: unresolved dependency");
        Precheck::Deferred(missing)
    }

    /// Put a claimed item back without consuming a retry.
    pub fn requeue(&mut self, id: &ItemId) -> bool {
        self.outbox
            .update(id, |item| {
                if item.state == ItemState::Dispatching {
                    item.state = ItemState::Queued;
                }
            })
            .is_some()
    }

    /// The server accepted the item.
    pub fn apply_success(&mut self, id: &ItemId, remote: Option<RemoteId>, now: u64) -> Result<Acknowledged> {
        let item = self.outbox.get(id).cloned().ok_or(StoreError::ItemNotFound(*id))?;
        let mut ack = Acknowledged {
            item,
            resolved: None,
            rewritten: Vec::new(),
            follow_up: None,
            removed: None,
        };

        match (ack.item.operation, ack.item.target) {
            (Operation::Create, Some(target)) if self.store.contains(&target) => {
                let remote = remote.ok_or(StoreError::MissingRemoteId(*id))?;
                match self.store.mark_synced(&target, remote, now) {
                    Ok(_) | Err(StoreError::RemoteIdConflict { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.outbox.remove(id);

                // The first confirmed id wins, even if this ack disagrees.
                if let Some(confirmed) = self.store.remote_id_of(&target) {
                    ack.rewritten = IdentifierResolver::on_resolved(&mut self.outbox, &target, &confirmed);
                    ack.resolved = Some((target, confirmed));
                }
                ack.follow_up = self.enqueue_deferred_delete(&target, now)?;
            }
            (Operation::Create, Some(target)) => {
                tracing::warn!(entity = %target, item = %id, "create acknowledged for unknown entity");
                self.outbox.remove(id);
            }
            (Operation::Delete, Some(target)) => {
                self.outbox.remove(id);
                if self.store.get(&target).map_or(false, |record| record.is_deleted()) {
                    self.store.remove_tombstone(&target)?;
                    ack.removed = Some(target);
                }
            }
            _ => {
                self.outbox.remove(id);
            }
        }

        tracing::debug!(
            item = %id,
            method = %ack.item.method,
            rewritten = ack.rewritten.len(),
            "acknowledged"
        );
        Ok(ack)
    }

    fn enqueue_deferred_delete(&mut self, target: &LocalId, now: u64) -> Result<Option<ItemId>> {
        let Some(record) = self.store.get(target) else {
            return Ok(None);
        };
        if !record.delete_on_ack {
            return Ok(None);
        }
        let spec = self.resources.get(&record.kind)?;
        let item = spec
            .delete_request(record, &self.store)
            .map(|request| self.outbox.enqueue(request, now).item_id());
        if let Some(item) = item {
            tracing::debug!(entity = %target, item = %item, "issuing delete deferred until create ack");
        }
        Ok(item)
    }

    /// Transient failure: back off, or give up after `max_retries`.
    pub fn apply_transient(
        &mut self,
        id: &ItemId,
        error: impl Into<String>,
        backoff: &BackoffPolicy,
        max_retries: u32,
        now: u64,
    ) -> Result<RetryDecision> {
        let error = error.into();
        let decision = self
            .outbox
            .update(id, |item| {
                item.retry_count = item.retry_count.saturating_add(1);
                item.last_error = Some(error);
                if item.retry_count > max_retries {
                    item.state = ItemState::Failed;
                    item.next_retry_at = None;
                    RetryDecision::Exhausted {
                        attempts: item.retry_count,
                    }
                } else {
                    let at = backoff.next_retry_at(now, item.retry_count);
                    item.state = ItemState::Retrying;
                    item.next_retry_at = Some(at);
                    RetryDecision::Scheduled {
                        attempt: item.retry_count,
                        next_retry_at: at,
                    }
                }
            })
            .ok_or(StoreError::ItemNotFound(*id))?;

        match decision {
            RetryDecision::Scheduled { attempt, next_retry_at } => tracing::debug!(
                item = %id,
                attempt,
                delay_ms = next_retry_at.saturating_sub(now),
                "scheduled retry"
            ),
            RetryDecision::Exhausted { attempts } => {
                tracing::warn!(item = %id, attempts, "retries exhausted")
            }
        }
        Ok(decision)
    }

    /// Permanent failure: the item stays in the outbox, surfaced, until it is
    /// retried or discarded by hand.
    pub fn apply_permanent(&mut self, id: &ItemId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let item = self
            .outbox
            .update(id, |item| {
                item.state = ItemState::Failed;
                item.next_retry_at = None;
                item.last_error = Some(error);
                item.clone()
            })
            .ok_or(StoreError::ItemNotFound(*id))?;
        tracing::warn!(
            item = %id,
            method = %item.method,
            url = %item.url_template,
            error = item.last_error.as_deref().unwrap_or_default(),
            "permanently failed"
        );

        // A rejected create of a record the user already deleted is done with.
        if item.operation == Operation::Create {
            if let Some(target) = item.target {
                let abandoned = self
                    .store
                    .get(&target)
                    .map_or(false, |record| record.delete_on_ack && record.remote_id().is_none());
                if abandoned {
                    self.outbox.remove(id);
                    self.store.hard_purge(&target)?;
                    tracing::debug!(entity = %target, "purged deleted entity whose create was rejected");
                }
            }
        }
        Ok(())
    }

    /// Put a failed item back in the queue.
    pub fn retry_failed(&mut self, id: &ItemId) -> Result<()> {
        let item = self.outbox.get(id).ok_or(StoreError::ItemNotFound(*id))?;
        if item.state != ItemState::Failed {
            return Err(StoreError::ItemNotFailed(*id));
        }
        self.outbox.update(id, |item| {
            item.state = ItemState::Queued;
            item.next_retry_at = None;
        });
        Ok(())
    }

    /// Drop a failed item. A failed create takes its never-synced entity and
    /// that entity's subtree with it.
    pub fn discard_failed(&mut self, id: &ItemId, now: u64) -> Result<CascadeReport> {
        let item = self.outbox.get(id).ok_or(StoreError::ItemNotFound(*id))?;
        if item.state != ItemState::Failed {
            return Err(StoreError::ItemNotFailed(*id));
        }
        let item = self.outbox.remove(id).ok_or(StoreError::ItemNotFound(*id))?;

        let never_synced = match (item.operation, item.target) {
            (Operation::Create, Some(target)) => self
                .store
                .get(&target)
                .filter(|record| record.remote_id().is_none())
                .map(|record| (target, record.is_deleted())),
            _ => None,
        };
        let mut report = match never_synced {
            // Already tombstoned while the create was out; nothing left below it.
            Some((target, true)) => {
                self.store.hard_purge(&target)?;
                CascadeReport {
                    purged: vec![target],
                    ..CascadeReport::default()
                }
            }
            Some((target, false)) => self.delete_entity(&target, now)?,
            None => CascadeReport::default(),
        };
        report.cancelled.insert(0, item.id);
        tracing::info!(item = %id, purged = report.purged.len(), "discarded failed item");
        Ok(report)
    }

    /// Items interrupted mid-flight (e.g. by a crash) go back to the queue.
    /// The server may have processed them, so they stay marked as attempted.
    pub fn recover_in_flight(&mut self) -> usize {
        let in_flight: Vec<ItemId> = self
            .outbox
            .iter()
            .filter(|item| item.state == ItemState::Dispatching)
            .map(|item| item.id)
            .collect();
        for id in &in_flight {
            self.outbox.update(id, |item| {
                item.state = ItemState::Queued;
                item.attempted = true;
            });
        }
        in_flight.len()
    }

    // ---- queries ----

    pub fn pending_count(&self) -> usize {
        self.outbox.pending_count()
    }

    pub fn failed_count(&self) -> usize {
        self.outbox.failed_count()
    }

    pub fn failed_items(&self) -> Vec<OutboxItem> {
        self.outbox.failed_items()
    }

    pub fn in_flight_count(&self) -> usize {
        self.outbox.in_flight_count()
    }

    /// Earliest pending retry, if any.
    pub fn next_retry_at(&self) -> Option<u64> {
        self.outbox
            .iter()
            .filter(|item| item.state == ItemState::Retrying)
            .filter_map(|item| item.next_retry_at)
            .min()
    }
}
