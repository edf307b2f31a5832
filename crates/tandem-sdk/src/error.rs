//! Error types for the Tandem SDK.

use crate::transport::TransportError;
use tandem_store::StoreError;
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug)]
pub enum SdkError {
    /// Local store or outbox error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Network failure surfaced to the caller.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Fields or patches must be JSON objects.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Background sync is not running.
    #[error("Background sync is not running")]
    NotRunning,

    /// Background sync is already running.
    #[error("Background sync is already running")]
    AlreadyRunning,

    /// The session was closed.
    #[error("Session is closed")]
    Closed,
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
