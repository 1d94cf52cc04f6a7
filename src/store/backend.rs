//! Storage backend trait definition.
//!
//! Plans, applied state and the state lock are all stored as opaque blobs
//! under string keys. A backend only has to provide these few primitives;
//! everything above it is backend-agnostic.

use async_trait::async_trait;

use crate::error::Result;

/// Key/value blob storage shared by the plan store and the state store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Reads an object.
    ///
    /// Returns `None` if no object is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes an object that must not exist yet.
    ///
    /// The write is all-or-nothing: readers see either no object or the full
    /// contents. Fails with `StoreError::AlreadyExists` if `key` is taken.
    async fn create(&self, key: &str, content: &[u8]) -> Result<()>;

    /// Writes an object, replacing any previous version atomically.
    async fn replace(&self, key: &str, content: &[u8]) -> Result<()>;

    /// Deletes an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Checks whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Lists the keys that start with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Human-readable location of the store, for diagnostics.
    fn location(&self) -> String;
}
