//! Resource routes - how an entity kind maps onto backend endpoints.
//!
//! A collection template may name references, e.g.
//! `/schedules/{schedule_id}/exercises`. A reference renders as the parent's
//! remote id when it is known, otherwise as its placeholder, in which case the
//! parent becomes a dependency of the request.

use crate::entity_store::LocalStore;
use crate::error::{Result, StoreError};
use crate::outbox::{Method, Operation, OutboundRequest, Priority};
use crate::resolver::placeholder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use tandem_core::{EntityKind, EntityRecord, LocalId};

/// How the backend expects a synced record to be deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// `DELETE {collection}/{remote_id}`
    Hard,
    /// `PATCH {collection}/{remote_id}` with `{"deleted": true}`
    Soft,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: EntityKind,
    pub collection: String,
    pub delete_policy: DeletePolicy,
    pub priority: Priority,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<EntityKind>, collection: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            collection: collection.into(),
            delete_policy: DeletePolicy::Hard,
            priority: Priority::Normal,
        }
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    fn collection_url(&self, record: &EntityRecord, store: &LocalStore) -> (String, BTreeSet<LocalId>) {
        let mut url = self.collection.clone();
        let mut deps = BTreeSet::new();
        for (name, parent) in &record.refs {
            let slot = format!("{{{}}}", name);
            if url.contains(&slot) {
                url = url.replace(&slot, &reference_token(store, parent, &mut deps));
            }
        }
        (url, deps)
    }

    /// `POST {collection}` carrying the fields, every reference and the
    /// client id.
    pub fn create_request(&self, record: &EntityRecord, store: &LocalStore) -> OutboundRequest {
        let (url, mut deps) = self.collection_url(record, store);

        let mut body = record.fields.clone();
        for (name, parent) in &record.refs {
            let token = reference_token(store, parent, &mut deps);
            body.insert(name.clone(), Value::String(token));
        }
        body.insert("client_id".to_string(), Value::String(record.id().to_string()));

        let mut request = OutboundRequest::new(Method::Post, url)
            .with_body(Value::Object(body))
            .with_target(record.id(), Operation::Create)
            .with_priority(self.priority);
        request.dependency_refs = deps;
        request
    }

    /// `PATCH {collection}/{id}`; the record itself is a dependency until
    /// its create is acknowledged.
    pub fn update_request(
        &self,
        record: &EntityRecord,
        patch: &Map<String, Value>,
        store: &LocalStore,
    ) -> OutboundRequest {
        let (collection, mut deps) = self.collection_url(record, store);
        let own = reference_token(store, &record.id(), &mut deps);

        let mut request = OutboundRequest::new(Method::Patch, format!("{}/{}", collection, own))
            .with_body(Value::Object(patch.clone()))
            .with_target(record.id(), Operation::Update)
            .with_priority(self.priority);
        request.dependency_refs = deps;
        request
    }

    /// Delete against the remote id. `None` when the record never synced.
    pub fn delete_request(&self, record: &EntityRecord, store: &LocalStore) -> Option<OutboundRequest> {
        let remote = record.remote_id()?;
        let (collection, deps) = self.collection_url(record, store);
        let url = format!("{}/{}", collection, remote);

        let mut request = match self.delete_policy {
            DeletePolicy::Hard => OutboundRequest::new(Method::Delete, url),
            DeletePolicy::Soft => {
                OutboundRequest::new(Method::Patch, url).with_body(json!({ "deleted": true }))
            }
        }
        .with_target(record.id(), Operation::Delete)
        .with_priority(self.priority);
        request.dependency_refs = deps;
        Some(request)
    }
}

/// Remote id if known, otherwise the placeholder (recording the dependency).
fn reference_token(store: &LocalStore, id: &LocalId, deps: &mut BTreeSet<LocalId>) -> String {
    match store.remote_id_of(id) {
        Some(remote) => remote.to_string(),
        None => {
            deps.insert(*id);
            placeholder(id)
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResourceRegistry {
    specs: HashMap<EntityKind, ResourceSpec>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ResourceSpec) {
        self.specs.insert(spec.kind.clone(), spec);
    }

    pub fn with(mut self, spec: ResourceSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, kind: &EntityKind) -> Result<&ResourceSpec> {
        self.specs
            .get(kind)
            .ok_or_else(|| StoreError::UnknownResource(kind.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tandem_core::RemoteId;

    fn exercise_spec() -> ResourceSpec {
        ResourceSpec::new("exercises", "/schedules/{schedule_id}/exercises")
    }

    fn setup() -> (LocalStore, LocalId, LocalId) {
        let mut store = LocalStore::new();
        let schedule = store
            .create("schedules".into(), Map::new(), BTreeMap::new(), 1)
            .unwrap();
        let mut fields = Map::new();
        fields.insert("name".into(), json!("Row"));
        let exercise = store
            .create(
                "exercises".into(),
                fields,
                BTreeMap::from([("schedule_id".to_string(), schedule)]),
                2,
            )
            .unwrap();
        (store, schedule, exercise)
    }

    #[test]
    fn test_create_uses_placeholders_for_unsynced_parent() {
        let (store, schedule, exercise) = setup();
        let request = exercise_spec().create_request(store.get(&exercise).unwrap(), &store);

        assert_eq!(request.method, Method::Post);
        assert_eq!(
            request.url_template,
            format!("/schedules/{}/exercises", placeholder(&schedule))
        );
        let body = request.body.unwrap();
        assert_eq!(body["schedule_id"], json!(placeholder(&schedule)));
        assert_eq!(body["client_id"], json!(exercise.to_string()));
        assert_eq!(body["name"], json!("Row"));
        assert_eq!(request.dependency_refs, BTreeSet::from([schedule]));
    }

    #[test]
    fn test_create_uses_remote_id_when_known() {
        let (mut store, schedule, exercise) = setup();
        store.mark_synced(&schedule, RemoteId::new("rS"), 3).unwrap();

        let request = exercise_spec().create_request(store.get(&exercise).unwrap(), &store);
        assert_eq!(request.url_template, "/schedules/rS/exercises");
        assert!(request.dependency_refs.is_empty());
    }

    #[test]
    fn test_update_depends_on_self_until_synced() {
        let (mut store, schedule, exercise) = setup();
        store.mark_synced(&schedule, RemoteId::new("rS"), 3).unwrap();

        let patch = json!({"name": "Pendlay row"}).as_object().cloned().unwrap();
        let request = exercise_spec().update_request(store.get(&exercise).unwrap(), &patch, &store);
        assert_eq!(request.method, Method::Patch);
        assert_eq!(
            request.url_template,
            format!("/schedules/rS/exercises/{}", placeholder(&exercise))
        );
        assert_eq!(request.dependency_refs, BTreeSet::from([exercise]));
    }

    #[test]
    fn test_delete_policies() {
        let (mut store, schedule, exercise) = setup();
        store.mark_synced(&schedule, RemoteId::new("rS"), 3).unwrap();
        assert!(exercise_spec()
            .delete_request(store.get(&exercise).unwrap(), &store)
            .is_none());

        store.mark_synced(&exercise, RemoteId::new("rE"), 4).unwrap();
        let record = store.get(&exercise).unwrap();

        let hard = exercise_spec().delete_request(record, &store).unwrap();
        assert_eq!(hard.method, Method::Delete);
        assert_eq!(hard.url_template, "/schedules/rS/exercises/rE");

        let soft = exercise_spec()
            .with_delete_policy(DeletePolicy::Soft)
            .delete_request(record, &store)
            .unwrap();
        assert_eq!(soft.method, Method::Patch);
        assert_eq!(soft.body, Some(json!({"deleted": true})));
    }

    #[test]
    fn test_registry_rejects_unknown_kind() {
        let registry = ResourceRegistry::new().with(exercise_spec());
        assert!(registry.get(&"exercises".into()).is_ok());
        assert!(matches!(
            registry.get(&"sets".into()),
            Err(StoreError::UnknownResource(_))
        ));
    }
}
