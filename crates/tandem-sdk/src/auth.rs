//! Bearer token source.
//!
//! Acquiring and refreshing tokens happens outside the engine; the dispatcher
//! only asks for the current token and reports when the backend rejected it.

use async_trait::async_trait;
use parking_lot::RwLock;

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// The token to send, or `None` when signed out.
    async fn bearer_token(&self) -> Option<String>;

    /// The backend answered 401 for the current token.
    async fn invalidate(&self) {}
}

/// A token set by the application, e.g. after a login screen.
#[derive(Debug, Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn invalidate(&self) {
        tracing::debug!("bearer token rejected by backend");
    }
}
