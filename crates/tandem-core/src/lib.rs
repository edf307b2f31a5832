//! Tandem core types: dual identities, entity records, backoff and
//! dispatch outcome classes shared by the store and the SDK.

pub mod backoff;
pub mod class;
pub mod entity;
pub mod hash;
pub mod ids;

pub use backoff::BackoffPolicy;
pub use class::ErrorClass;
pub use entity::{EntityKind, EntityRecord, SyncStatus};
pub use hash::PayloadHash;
pub use ids::{CorrelationId, Identity, ItemId, LocalId, RemoteId};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
