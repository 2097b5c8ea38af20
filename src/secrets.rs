//! Secret store interface.
//!
//! Secrets live in an external store (vault, cloud secret manager) and are
//! fetched by reference. The engine never persists secret values; resolved
//! secrets are cached inside the run context for the run's lifetime only,
//! and the in-memory representation zeroizes on drop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// A secret value. Redacted in Debug output, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the underlying value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretValue").field(&"[REDACTED]").finish()
    }
}

/// External secret store, keyed by opaque reference strings.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by reference.
    ///
    /// An unknown reference is a `Validation` failure (non-retryable); stores
    /// should return `Network` only for genuinely transient conditions.
    async fn fetch(&self, reference: &str) -> Result<SecretValue>;
}

/// In-memory secret store for tests and embedded use.
#[derive(Default)]
pub struct InMemorySecretStore {
    entries: HashMap<String, SecretValue>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, reference: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(reference.into(), SecretValue::new(value));
        self
    }

    pub fn into_shared(self) -> Arc<dyn SecretStore> {
        Arc::new(self)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn fetch(&self, reference: &str) -> Result<SecretValue> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("Unknown secret reference '{}'", reference)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_known_reference() {
        let store = InMemorySecretStore::new().with_secret("vault/token", "s3cr3t");
        let value = store.fetch("vault/token").await.unwrap();
        assert_eq!(value.expose(), "s3cr3t");
    }

    #[tokio::test]
    async fn unknown_reference_is_validation_error() {
        let store = InMemorySecretStore::new();
        let err = store.fetch("vault/missing").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn debug_is_redacted() {
        let value = SecretValue::new("hunter2");
        assert!(!format!("{:?}", value).contains("hunter2"));
    }
}
