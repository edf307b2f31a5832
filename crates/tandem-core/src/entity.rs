//! Entity records held by the local store.

use crate::ids::{Identity, LocalId, RemoteId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a domain entity, e.g. `schedules` or `sets`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(pub String);

impl EntityKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Synchronization state of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Written locally, not yet acknowledged by the server.
    Pending,
    /// Acknowledged by the server; the remote id is known.
    Synced,
    /// Tombstone kept until the server has seen the deletion.
    Deleted,
}

/// A domain record with dual identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub identity: Identity,
    pub kind: EntityKind,
    /// Named references to parent records, always by local id.
    pub refs: BTreeMap<String, LocalId>,
    pub fields: Map<String, Value>,
    pub sync_status: SyncStatus,
    /// Deleted before the server acknowledged a create that may already have
    /// reached it; the delete is issued once the acknowledgement arrives.
    #[serde(default)]
    pub delete_on_ack: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl EntityRecord {
    pub fn new(
        kind: EntityKind,
        fields: Map<String, Value>,
        refs: BTreeMap<String, LocalId>,
        now: u64,
    ) -> Self {
        Self {
            identity: Identity::unresolved(LocalId::new()),
            kind,
            refs,
            fields,
            sync_status: SyncStatus::Pending,
            delete_on_ack: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> LocalId {
        self.identity.local
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.identity.remote.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    pub fn is_deleted(&self) -> bool {
        self.sync_status == SyncStatus::Deleted
    }

    /// Parent records this one points at.
    pub fn parents(&self) -> impl Iterator<Item = &LocalId> {
        self.refs.values()
    }

    /// Shallow-merge a patch into the domain fields.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>, now: u64) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = now;
    }
}
