//! Error types for the store layer.

use tandem_core::{EntityKind, ItemId, LocalId, RemoteId};
use thiserror::Error;

/// Errors that can occur in store and outbox operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(LocalId),

    #[error("Entity {0} is deleted")]
    Deleted(LocalId),

    #[error("Remote id conflict for {local}: has {existing}, got {proposed}")]
    RemoteIdConflict {
        local: LocalId,
        existing: RemoteId,
        proposed: RemoteId,
    },

    #[error("Entity {0} cannot be purged: it is known to the server")]
    IllegalPurge(LocalId),

    #[error("No resource registered for kind: {0}")]
    UnknownResource(EntityKind),

    #[error("Reference {name} points at missing entity {target}")]
    UnknownReference { name: String, target: LocalId },

    #[error("Outbox item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Outbox item {0} has not failed")]
    ItemNotFailed(ItemId),

    #[error("Create {0} was acknowledged without a remote id")]
    MissingRemoteId(ItemId),

    #[error("Corrupted local state: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
