//! # tandem-store
//!
//! Local persistence layer for the Tandem sync engine.
//!
//! This crate provides:
//! - A local record store keyed by client-generated ids, with remote-id and
//!   parent indexes
//! - A dependency-ordered outbox with priority tiers and payload dedup
//! - Placeholder rewriting once a parent's server id is known
//! - Cascading deletes that cancel work the server never saw
//! - Versioned, atomically written snapshots
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem_store::{ResourceRegistry, ResourceSpec, SyncDatabase};
//!
//! let resources = ResourceRegistry::new()
//!     .with(ResourceSpec::new("schedules", "/schedules"))
//!     .with(ResourceSpec::new("exercises", "/schedules/{schedule_id}/exercises"));
//! let mut db = SyncDatabase::new(resources, 5_000);
//!
//! let schedule = db.create_entity("schedules".into(), fields, BTreeMap::new(), now)?;
//! let exercise = db.create_entity(
//!     "exercises".into(),
//!     fields,
//!     BTreeMap::from([("schedule_id".to_string(), schedule)]),
//!     now,
//! )?;
//!
//! // Only the schedule create is eligible until the server assigns its id.
//! let batch = db.claim_batch(now, 8, &HashSet::new());
//! ```

pub mod cascade;
pub mod database;
pub mod entity_store;
pub mod error;
pub mod outbox;
pub mod resolver;
pub mod resource;
pub mod snapshot;

pub use cascade::{CascadeHandler, CascadeReport};
pub use database::{Acknowledged, Precheck, RetryDecision, SyncDatabase};
pub use entity_store::{LocalStore, MarkSynced};
pub use outbox::{
    Enqueued, ItemState, Method, Operation, OutboundRequest, Outbox, OutboxItem, Priority,
    DEFAULT_DEDUP_WINDOW_MS,
};
pub use resolver::{placeholder, unresolved_placeholders, IdentifierResolver};
pub use resource::{DeletePolicy, ResourceRegistry, ResourceSpec};
pub use snapshot::{SnapshotWrite, StoreSnapshot, SNAPSHOT_VERSION};

pub use error::{Result, StoreError};
