//! Local Store - durable keyed storage of entities with dual identity.
//!
//! Writes are synchronous and never touch the network. Every read observes
//! the latest local write. The store is indexed by local id, by remote id and
//! by parent (reverse reference index) so cascades can walk descendants.

use crate::error::{Result, StoreError};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tandem_core::{EntityKind, EntityRecord, LocalId, RemoteId, SyncStatus};

/// Result of confirming a server-assigned id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkSynced {
    /// The remote id was recorded for the first time.
    Resolved,
    /// The same remote id was already recorded; nothing changed.
    AlreadyResolved,
}

#[derive(Clone, Debug, Default)]
pub struct LocalStore {
    entities: BTreeMap<LocalId, EntityRecord>,
    by_remote: HashMap<RemoteId, LocalId>,
    /// parent -> children
    children: HashMap<LocalId, BTreeSet<LocalId>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store (and its indexes) from persisted records.
    pub fn from_records(records: impl IntoIterator<Item = EntityRecord>) -> Result<Self> {
        let mut store = Self::new();
        for record in records {
            let id = record.id();
            if store.entities.contains_key(&id) {
                return Err(StoreError::Corrupted(format!("duplicate entity {}", id)));
            }
            if let Some(remote) = record.remote_id() {
                if let Some(other) = store.by_remote.insert(remote.clone(), id) {
                    return Err(StoreError::Corrupted(format!(
                        "remote id {} shared by {} and {}",
                        remote, other, id
                    )));
                }
            }
            store.insert_indexed(record);
        }
        Ok(store)
    }

    fn insert_indexed(&mut self, record: EntityRecord) {
        let id = record.id();
        for parent in record.parents() {
            self.children.entry(*parent).or_default().insert(id);
        }
        self.entities.insert(id, record);
    }

    /// Create a pending record. References must point at live records.
    pub fn create(
        &mut self,
        kind: EntityKind,
        fields: Map<String, Value>,
        refs: BTreeMap<String, LocalId>,
        now: u64,
    ) -> Result<LocalId> {
        for (name, target) in &refs {
            match self.entities.get(target) {
                Some(parent) if !parent.is_deleted() => {}
                _ => {
                    return Err(StoreError::UnknownReference {
                        name: name.clone(),
                        target: *target,
                    })
                }
            }
        }

        let record = EntityRecord::new(kind, fields, refs, now);
        let id = record.id();
        self.insert_indexed(record);
        Ok(id)
    }

    pub fn get(&self, id: &LocalId) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    pub fn get_by_remote(&self, remote: &RemoteId) -> Option<&EntityRecord> {
        self.by_remote
            .get(remote)
            .and_then(|local| self.entities.get(local))
    }

    pub fn remote_id_of(&self, id: &LocalId) -> Option<RemoteId> {
        self.entities
            .get(id)
            .and_then(|record| record.remote_id().cloned())
    }

    pub fn contains(&self, id: &LocalId) -> bool {
        self.entities.contains_key(id)
    }

    /// Merge a patch into a record's fields. Identity is untouched.
    pub fn update(&mut self, id: &LocalId, patch: &Map<String, Value>, now: u64) -> Result<()> {
        let record = self.entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if record.is_deleted() {
            return Err(StoreError::Deleted(*id));
        }
        record.apply_patch(patch, now);
        Ok(())
    }

    /// Record the server-assigned id. Set at most once, never changed.
    pub fn mark_synced(&mut self, id: &LocalId, remote: RemoteId, now: u64) -> Result<MarkSynced> {
        let record = self.entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        if let Some(existing) = &record.identity.remote {
            if *existing == remote {
                return Ok(MarkSynced::AlreadyResolved);
            }
            tracing::error!(
                entity = %id,
                existing = %existing,
                proposed = %remote,
                "remote id conflict; keeping the first confirmed id"
            );
            return Err(StoreError::RemoteIdConflict {
                local: *id,
                existing: existing.clone(),
                proposed: remote,
            });
        }

        if let Some(owner) = self.by_remote.get(&remote) {
            if owner != id {
                tracing::error!(
                    entity = %id,
                    owner = %owner,
                    remote = %remote,
                    "remote id already belongs to another entity"
                );
                return Err(StoreError::Corrupted(format!(
                    "remote id {} already assigned to {}",
                    remote, owner
                )));
            }
        }

        record.identity.remote = Some(remote.clone());
        if record.sync_status == SyncStatus::Pending {
            record.sync_status = SyncStatus::Synced;
        }
        record.updated_at = now;
        self.by_remote.insert(remote, *id);
        Ok(MarkSynced::Resolved)
    }

    /// Tombstone a record. The row is retained.
    pub fn soft_delete(&mut self, id: &LocalId, now: u64) -> Result<()> {
        let record = self.entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        record.sync_status = SyncStatus::Deleted;
        record.updated_at = now;
        Ok(())
    }

    /// Tombstone a never-synced record whose create may already be on the
    /// server. The delete is issued when the create is acknowledged.
    pub fn mark_delete_on_ack(&mut self, id: &LocalId, now: u64) -> Result<()> {
        let record = self.entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        record.sync_status = SyncStatus::Deleted;
        record.delete_on_ack = true;
        record.updated_at = now;
        Ok(())
    }

    /// Remove a record the server never knew about.
    pub fn hard_purge(&mut self, id: &LocalId) -> Result<EntityRecord> {
        let record = self.entities.get(id).ok_or(StoreError::NotFound(*id))?;
        let legal = record.remote_id().is_none() && (record.is_pending() || record.delete_on_ack);
        if !legal {
            return Err(StoreError::IllegalPurge(*id));
        }
        self.remove(id).ok_or(StoreError::NotFound(*id))
    }

    /// Remove a tombstone once its delete reached the server.
    pub fn remove_tombstone(&mut self, id: &LocalId) -> Result<EntityRecord> {
        let record = self.entities.get(id).ok_or(StoreError::NotFound(*id))?;
        if !record.is_deleted() {
            return Err(StoreError::IllegalPurge(*id));
        }
        self.remove(id).ok_or(StoreError::NotFound(*id))
    }

    fn remove(&mut self, id: &LocalId) -> Option<EntityRecord> {
        let record = self.entities.remove(id)?;
        for parent in record.parents() {
            if let Some(children) = self.children.get_mut(parent) {
                children.remove(id);
                if children.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        if let Some(remote) = record.remote_id() {
            self.by_remote.remove(remote);
        }
        Some(record)
    }

    /// Direct children of a record.
    pub fn children(&self, id: &LocalId) -> Vec<LocalId> {
        self.children
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All transitive descendants, parents before children.
    pub fn descendants(&self, id: &LocalId) -> Vec<LocalId> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<LocalId> = self.children(id).into();

        while let Some(next) = queue.pop_front() {
            if next == *id || !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.children(&next));
        }
        order
    }

    /// The record itself plus every ancestor reachable through references.
    pub fn lineage(&self, id: &LocalId) -> BTreeSet<LocalId> {
        let mut lineage = BTreeSet::new();
        let mut stack = vec![*id];
        while let Some(next) = stack.pop() {
            if !lineage.insert(next) {
                continue;
            }
            if let Some(record) = self.entities.get(&next) {
                stack.extend(record.parents().copied());
            }
        }
        lineage
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn records(&self) -> Vec<EntityRecord> {
        self.entities.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of records not yet acknowledged by the server.
    pub fn unsynced_count(&self) -> usize {
        self.entities
            .values()
            .filter(|record| record.sync_status != SyncStatus::Synced)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn chain(store: &mut LocalStore) -> (LocalId, LocalId, LocalId) {
        let schedule = store
            .create("schedules".into(), fields(json!({"name": "A"})), BTreeMap::new(), 1)
            .unwrap();
        let exercise = store
            .create(
                "exercises".into(),
                fields(json!({"name": "Squat"})),
                BTreeMap::from([("schedule_id".to_string(), schedule)]),
                2,
            )
            .unwrap();
        let set = store
            .create(
                "sets".into(),
                fields(json!({"reps": 5})),
                BTreeMap::from([("exercise_id".to_string(), exercise)]),
                3,
            )
            .unwrap();
        (schedule, exercise, set)
    }

    #[test]
    fn test_create_is_pending() {
        let mut store = LocalStore::new();
        let (schedule, _, _) = chain(&mut store);

        let record = store.get(&schedule).unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(record.remote_id().is_none());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_create_rejects_unknown_reference() {
        let mut store = LocalStore::new();
        let missing = LocalId::new();
        let result = store.create(
            "sets".into(),
            Map::new(),
            BTreeMap::from([("exercise_id".to_string(), missing)]),
            1,
        );
        assert!(matches!(result, Err(StoreError::UnknownReference { .. })));
    }

    #[test]
    fn test_update_reads_own_write() {
        let mut store = LocalStore::new();
        let (_, _, set) = chain(&mut store);

        store.update(&set, &fields(json!({"reps": 12})), 9).unwrap();
        assert_eq!(store.get(&set).unwrap().fields["reps"], json!(12));
    }

    #[test]
    fn test_mark_synced_once() {
        let mut store = LocalStore::new();
        let (schedule, _, _) = chain(&mut store);

        assert_eq!(
            store.mark_synced(&schedule, RemoteId::new("r1"), 5).unwrap(),
            MarkSynced::Resolved
        );
        assert_eq!(
            store.mark_synced(&schedule, RemoteId::new("r1"), 6).unwrap(),
            MarkSynced::AlreadyResolved
        );

        let conflict = store.mark_synced(&schedule, RemoteId::new("r2"), 7);
        assert!(matches!(conflict, Err(StoreError::RemoteIdConflict { .. })));

        let record = store.get(&schedule).unwrap();
        assert_eq!(record.remote_id(), Some(&RemoteId::new("r1")));
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(store.get_by_remote(&RemoteId::new("r1")).unwrap().id(), schedule);
    }

    #[test]
    fn test_hard_purge_only_unsynced() {
        let mut store = LocalStore::new();
        let (schedule, exercise, set) = chain(&mut store);

        store.mark_synced(&schedule, RemoteId::new("r1"), 5).unwrap();
        assert!(matches!(
            store.hard_purge(&schedule),
            Err(StoreError::IllegalPurge(_))
        ));

        store.hard_purge(&set).unwrap();
        assert!(store.get(&set).is_none());
        assert!(store.children(&exercise).is_empty());
    }

    #[test]
    fn test_tombstone_lifecycle() {
        let mut store = LocalStore::new();
        let (schedule, _, _) = chain(&mut store);
        store.mark_synced(&schedule, RemoteId::new("r1"), 5).unwrap();

        store.soft_delete(&schedule, 6).unwrap();
        assert!(store.get(&schedule).unwrap().is_deleted());
        assert!(matches!(
            store.update(&schedule, &Map::new(), 7),
            Err(StoreError::Deleted(_))
        ));

        store.remove_tombstone(&schedule).unwrap();
        assert!(store.get(&schedule).is_none());
        assert!(store.get_by_remote(&RemoteId::new("r1")).is_none());
    }

    #[test]
    fn test_descendants_and_lineage() {
        let mut store = LocalStore::new();
        let (schedule, exercise, set) = chain(&mut store);

        assert_eq!(store.descendants(&schedule), vec![exercise, set]);
        assert_eq!(
            store.lineage(&set),
            BTreeSet::from([schedule, exercise, set])
        );
    }

    #[test]
    fn test_from_records_rejects_shared_remote_ids() {
        let mut store = LocalStore::new();
        let (schedule, exercise, _) = chain(&mut store);
        store.mark_synced(&schedule, RemoteId::new("r1"), 5).unwrap();

        let mut records = store.records();
        for record in records.iter_mut() {
            if record.id() == exercise {
                record.identity.remote = Some(RemoteId::new("r1"));
            }
        }
        assert!(matches!(
            LocalStore::from_records(records),
            Err(StoreError::Corrupted(_))
        ));
    }
}
