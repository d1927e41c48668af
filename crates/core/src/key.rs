//! Identity keys used to collapse equivalent in-flight operations.
//!
//! Two operations with equal keys are considered the same request for
//! deduplication purposes: the engine guarantees at most one of them is
//! live at any instant.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Method;

/// Stable identity of an operation, derived from its method, URL, and
/// ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    /// Compute the key for a request shape.
    ///
    /// The key is a hex-encoded SHA-256 over the method, the URL as given
    /// (relative URLs are hashed unresolved so the key survives a target
    /// swap), and each parameter pair in order. Parameter order is
    /// significant: callers that want order-insensitive dedup should sort
    /// before building the operation.
    #[must_use]
    pub fn compute(method: Method, url: &str, params: &[(String, String)]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        for (name, value) in params {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b";");
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// The hex digest as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
