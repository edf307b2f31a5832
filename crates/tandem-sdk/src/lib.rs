//! Tandem SDK - offline-first sync for applications that keep writing while
//! the network is gone.
//!
//! Mutations land in a local store and an outbox right away. A dispatcher
//! drains the outbox in dependency order once a backend is reachable,
//! rewriting client ids into server ids as parents are acknowledged.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem_sdk::prelude::*;
//!
//! let resources = ResourceRegistry::new()
//!     .with(ResourceSpec::new("schedules", "/schedules"))
//!     .with(ResourceSpec::new("exercises", "/schedules/{schedule_id}/exercises"));
//! let session = Session::open(
//!     SyncConfig::default(),
//!     resources,
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(StaticToken::new("token")),
//! )
//! .await?;
//!
//! // Works offline: both records exist locally before anything is sent.
//! let schedule = session.create("schedules", json!({"name": "Push day"}), &[])?;
//! let bench = session.create("exercises", json!({"name": "Bench"}), &[("schedule_id", schedule)])?;
//!
//! // The exercise goes out only after the schedule has its server id.
//! session.sync_now().await?;
//! ```
//!
//! # Architecture
//!
//! - [`session`] - The handle an application holds; local reads and writes
//! - [`dispatcher`] - Drain cycles: claim, send, classify, apply
//! - [`sync`] - Configuration, events and the background loop
//! - [`transport`] - Backend trait, wire types and response classification
//! - [`auth`] - Bearer token source
//! - [`memory`] - In-memory backend
//! - [`error`] - Error types

pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod session;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use auth::{StaticToken, TokenProvider};
pub use dispatcher::{DrainReport, Dispatcher};
pub use error::{Result, SdkError};
pub use memory::{Fault, MemoryBackend, ServerRecord};
pub use session::Session;
pub use sync::{SyncConfig, SyncConfigBuilder, SyncEvent, SyncManager};
pub use transport::{classify, Backend, HttpRequest, HttpResponse, Outcome, TransportError};

// Re-export commonly used types from the lower layers
pub use tandem_core::{EntityKind, EntityRecord, ErrorClass, ItemId, LocalId, RemoteId, SyncStatus};
pub use tandem_store::{
    CascadeReport, DeletePolicy, Enqueued, ItemState, Method, OutboundRequest, OutboxItem, Priority,
    ResourceRegistry, ResourceSpec, StoreError,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{StaticToken, TokenProvider};
    pub use crate::error::SdkError;
    pub use crate::memory::MemoryBackend;
    pub use crate::session::Session;
    pub use crate::sync::{SyncConfig, SyncConfigBuilder, SyncEvent};
    pub use crate::transport::Backend;
    pub use tandem_core::{EntityKind, LocalId, RemoteId, SyncStatus};
    pub use tandem_store::{ResourceRegistry, ResourceSpec};
}
