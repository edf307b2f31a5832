//! Payload digests used to suppress duplicate enqueues.
//!
//! A payload hash is the SHA-256 of `method`, `url` and the serialized body.
//! `serde_json` keeps object keys sorted, so equal bodies hash equally.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest of an outbound request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PayloadHash([u8; 32]);

impl PayloadHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PayloadHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of a request. Fields are separated so that `("a", "bc")` and
    /// `("ab", "c")` do not collide.
    pub fn of_request(method: &str, url: &str, body: Option<&Value>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update([0u8]);
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        if let Some(body) = body {
            hasher.update(body.to_string().as_bytes());
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        PayloadHash(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadHash({}...)", self.short())
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
