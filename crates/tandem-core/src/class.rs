//! Classification of dispatch outcomes.
//!
//! Every response (or transport failure) seen by the dispatcher is mapped to
//! one of these classes, which decides what happens to the outbox item.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Connection failure or timeout. Retried with backoff.
    TransientNetwork,
    /// 5xx or 429. Retried with backoff.
    ServerTransient,
    /// A referenced id has no remote counterpart yet. Deferred, not an error.
    UnresolvedDependency,
    /// 4xx other than 401/429. Marked failed, never retried automatically.
    ValidationPermanent,
    /// 401. Dispatch halts until a fresh token is available.
    AuthExpired,
    /// The server already processed this correlation id. Treated as success.
    DuplicateDetected,
}

impl ErrorClass {
    /// Classify an HTTP status that is not a plain success.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(ErrorClass::AuthExpired),
            429 => Some(ErrorClass::ServerTransient),
            500..=599 => Some(ErrorClass::ServerTransient),
            _ => Some(ErrorClass::ValidationPermanent),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork | ErrorClass::ServerTransient
        )
    }

    pub fn counts_as_success(&self) -> bool {
        matches!(self, ErrorClass::DuplicateDetected)
    }
}
