//! Cascade handler - local deletions and their effect on the outbox.
//!
//! Deleting a record the server never saw purges it, its never-synced
//! descendants and every outbox item that targets or depends on any of them,
//! without a single network call. Deleting a synced record tombstones it and
//! enqueues the delete; descendants are handled first so their deletes reach
//! the server before the parent's.

use crate::entity_store::LocalStore;
use crate::error::{Result, StoreError};
use crate::outbox::{Enqueued, ItemState, Operation, Outbox};
use crate::resource::ResourceRegistry;
use tandem_core::{ItemId, LocalId};

/// What a cascade did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Records removed outright.
    pub purged: Vec<LocalId>,
    /// Records kept as tombstones until the server acknowledges.
    pub tombstoned: Vec<LocalId>,
    /// Outbox items removed without being sent.
    pub cancelled: Vec<ItemId>,
    /// Delete requests enqueued.
    pub enqueued: Vec<ItemId>,
}

impl CascadeReport {
    pub fn is_empty(&self) -> bool {
        self.purged.is_empty()
            && self.tombstoned.is_empty()
            && self.cancelled.is_empty()
            && self.enqueued.is_empty()
    }
}

pub struct CascadeHandler<'a> {
    store: &'a mut LocalStore,
    outbox: &'a mut Outbox,
    resources: &'a ResourceRegistry,
    now: u64,
    report: CascadeReport,
}

impl<'a> CascadeHandler<'a> {
    pub fn new(
        store: &'a mut LocalStore,
        outbox: &'a mut Outbox,
        resources: &'a ResourceRegistry,
        now: u64,
    ) -> Self {
        Self {
            store,
            outbox,
            resources,
            now,
            report: CascadeReport::default(),
        }
    }

    /// Delete `id` and everything below it.
    pub fn delete(mut self, id: &LocalId) -> Result<CascadeReport> {
        let record = self.store.get(id).ok_or(StoreError::NotFound(*id))?;
        if record.is_deleted() {
            return Ok(self.report);
        }

        // Children before parents.
        let mut subtree = vec![*id];
        subtree.extend(self.store.descendants(id));

        // Every delete request must be buildable before anything changes.
        for node in &subtree {
            if let Some(record) = self.store.get(node) {
                if record.remote_id().is_some() && !record.is_deleted() {
                    self.resources.get(&record.kind)?;
                }
            }
        }

        for node in subtree.iter().rev() {
            self.delete_one(node)?;
        }

        tracing::debug!(
            entity = %id,
            purged = self.report.purged.len(),
            tombstoned = self.report.tombstoned.len(),
            cancelled = self.report.cancelled.len(),
            "cascade delete"
        );
        Ok(self.report)
    }

    fn delete_one(&mut self, id: &LocalId) -> Result<()> {
        let Some(record) = self.store.get(id) else {
            return Ok(());
        };
        if record.is_deleted() {
            return Ok(());
        }
        if record.remote_id().is_some() {
            self.delete_synced(id)
        } else {
            self.delete_unsynced(id)
        }
    }

    fn delete_unsynced(&mut self, id: &LocalId) -> Result<()> {
        let create_reached_server = self.outbox.items_for_target(id).iter().any(|item_id| {
            self.outbox.get(item_id).map_or(false, |item| {
                item.operation == Operation::Create && item.may_have_reached_server()
            })
        });

        self.cancel_unsent(id, |operation| {
            !(create_reached_server && operation == Operation::Create)
        });

        if create_reached_server {
            self.store.mark_delete_on_ack(id, self.now)?;
            self.report.tombstoned.push(*id);
        } else {
            self.store.hard_purge(id)?;
            self.report.purged.push(*id);
        }
        Ok(())
    }

    fn delete_synced(&mut self, id: &LocalId) -> Result<()> {
        let record = self.store.get(id).ok_or(StoreError::NotFound(*id))?;
        let request = self.resources.get(&record.kind)?.delete_request(record, self.store);

        // Pending edits of a record about to disappear are pointless.
        self.cancel_unsent(id, |operation| operation == Operation::Update);

        self.store.soft_delete(id, self.now)?;
        self.report.tombstoned.push(*id);

        if let Some(request) = request {
            if let Enqueued::Added(item) = self.outbox.enqueue(request, self.now) {
                self.report.enqueued.push(item);
            }
        }
        Ok(())
    }

    /// Remove never-sent items targeting `id` (filtered by operation) and
    /// every never-sent item depending on it.
    fn cancel_unsent(&mut self, id: &LocalId, cancel_op: impl Fn(Operation) -> bool) {
        let mut doomed: Vec<ItemId> = self
            .outbox
            .items_for_target(id)
            .into_iter()
            .filter(|item_id| {
                self.outbox
                    .get(item_id)
                    .map_or(false, |item| cancel_op(item.operation) && !item.may_have_reached_server())
            })
            .collect();
        doomed.extend(self.outbox.items_depending_on(id).into_iter().filter(|item_id| {
            self.outbox
                .get(item_id)
                .map_or(false, |item| item.state != ItemState::Dispatching)
        }));

        for item_id in doomed {
            if self.outbox.remove(&item_id).is_some() {
                self.report.cancelled.push(item_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Method;
    use crate::resource::ResourceSpec;
    use serde_json::Map;
    use std::collections::BTreeMap;
    use tandem_core::RemoteId;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new()
            .with(ResourceSpec::new("schedules", "/schedules"))
            .with(ResourceSpec::new("exercises", "/exercises"))
    }

    fn create(
        store: &mut LocalStore,
        outbox: &mut Outbox,
        resources: &ResourceRegistry,
        kind: &str,
        parent: Option<LocalId>,
    ) -> (LocalId, ItemId) {
        let refs = parent
            .map(|p| BTreeMap::from([("parent_id".to_string(), p)]))
            .unwrap_or_default();
        let id = store.create(kind.into(), Map::new(), refs, 1).unwrap();
        let request = resources
            .get(&kind.into())
            .unwrap()
            .create_request(store.get(&id).unwrap(), store);
        let item = outbox.enqueue(request, 1).item_id();
        (id, item)
    }

    #[test]
    fn test_unsynced_subtree_is_purged() {
        let resources = registry();
        let mut store = LocalStore::new();
        let mut outbox = Outbox::new(0);
        let (schedule, _) = create(&mut store, &mut outbox, &resources, "schedules", None);
        let (exercise, _) = create(&mut store, &mut outbox, &resources, "exercises", Some(schedule));

        let report = CascadeHandler::new(&mut store, &mut outbox, &resources, 5)
            .delete(&schedule)
            .unwrap();

        assert_eq!(report.purged, vec![exercise, schedule]);
        assert_eq!(report.cancelled.len(), 2);
        assert!(store.is_empty());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_in_flight_create_becomes_delete_on_ack() {
        let resources = registry();
        let mut store = LocalStore::new();
        let mut outbox = Outbox::new(0);
        let (schedule, item) = create(&mut store, &mut outbox, &resources, "schedules", None);
        outbox.update(&item, |i| i.state = ItemState::Dispatching);

        let report = CascadeHandler::new(&mut store, &mut outbox, &resources, 5)
            .delete(&schedule)
            .unwrap();

        assert_eq!(report.tombstoned, vec![schedule]);
        assert!(outbox.get(&item).is_some());
        let record = store.get(&schedule).unwrap();
        assert!(record.is_deleted());
        assert!(record.delete_on_ack);
    }

    #[test]
    fn test_synced_delete_enqueues_children_first() {
        let resources = registry();
        let mut store = LocalStore::new();
        let mut outbox = Outbox::new(0);
        let (schedule, s_item) = create(&mut store, &mut outbox, &resources, "schedules", None);
        let (exercise, e_item) = create(&mut store, &mut outbox, &resources, "exercises", Some(schedule));
        outbox.remove(&s_item);
        outbox.remove(&e_item);
        store.mark_synced(&schedule, RemoteId::new("rS"), 2).unwrap();
        store.mark_synced(&exercise, RemoteId::new("rE"), 2).unwrap();

        let report = CascadeHandler::new(&mut store, &mut outbox, &resources, 5)
            .delete(&schedule)
            .unwrap();

        assert_eq!(report.tombstoned, vec![exercise, schedule]);
        let urls: Vec<_> = outbox.iter().map(|i| (i.method, i.url_template.clone())).collect();
        assert_eq!(
            urls,
            vec![
                (Method::Delete, "/exercises/rE".to_string()),
                (Method::Delete, "/schedules/rS".to_string()),
            ]
        );
        assert!(store.get(&schedule).unwrap().is_deleted());
    }

    #[test]
    fn test_unknown_kind_leaves_subtree_untouched() {
        let resources = registry();
        let mut store = LocalStore::new();
        let mut outbox = Outbox::new(0);
        let (schedule, s_item) = create(&mut store, &mut outbox, &resources, "schedules", None);
        let (exercise, e_item) = create(&mut store, &mut outbox, &resources, "exercises", Some(schedule));
        outbox.remove(&s_item);
        outbox.remove(&e_item);
        store.mark_synced(&schedule, RemoteId::new("rS"), 2).unwrap();
        store.mark_synced(&exercise, RemoteId::new("rE"), 2).unwrap();

        // Reopened with routes that no longer know exercises.
        let narrower = ResourceRegistry::new().with(ResourceSpec::new("schedules", "/schedules"));
        let result = CascadeHandler::new(&mut store, &mut outbox, &narrower, 5).delete(&schedule);

        assert!(matches!(result, Err(StoreError::UnknownResource(_))));
        assert!(!store.get(&schedule).unwrap().is_deleted());
        assert!(!store.get(&exercise).unwrap().is_deleted());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_repeated_delete_is_noop() {
        let resources = registry();
        let mut store = LocalStore::new();
        let mut outbox = Outbox::new(0);
        let (schedule, s_item) = create(&mut store, &mut outbox, &resources, "schedules", None);
        outbox.remove(&s_item);
        store.mark_synced(&schedule, RemoteId::new("rS"), 2).unwrap();

        CascadeHandler::new(&mut store, &mut outbox, &resources, 5)
            .delete(&schedule)
            .unwrap();
        let again = CascadeHandler::new(&mut store, &mut outbox, &resources, 6)
            .delete(&schedule)
            .unwrap();

        assert!(again.is_empty());
        assert_eq!(outbox.len(), 1);
    }
}
