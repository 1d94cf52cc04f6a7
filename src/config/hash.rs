//! Content hashing for change detection and plan integrity.
//!
//! Resource hashes decide whether a declared resource differs from what was
//! last applied. Checksums seal the change list of a plan artifact so that a
//! tampered or truncated artifact is rejected before it is applied.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hasher for resource state and plan contents.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHasher;

impl ContentHasher {
    /// Creates a new content hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's kind and properties.
    ///
    /// Object keys are hashed in sorted order, so two documents that differ
    /// only in key order hash identically.
    #[must_use]
    pub fn hash_resource(&self, kind: &str, properties: &Map<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        Self::update_value(&mut hasher, &Value::Object(properties.clone()));
        hex::encode(hasher.finalize())
    }

    /// Computes the SHA-256 checksum of a value's JSON serialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn checksum<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        let mut hasher = Sha256::new();
        Self::update_value(&mut hasher, &value);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Feeds a JSON value into the hasher in canonical form.
    fn update_value(hasher: &mut Sha256, value: &Value) {
        match value {
            Value::Null => hasher.update(b"n"),
            Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
            Value::Number(n) => {
                hasher.update(b"#");
                hasher.update(n.to_string().as_bytes());
                hasher.update([0u8]);
            }
            Value::String(s) => {
                hasher.update(b"s");
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Value::Array(items) => {
                hasher.update(b"[");
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    Self::update_value(hasher, item);
                }
            }
            Value::Object(map) => {
                hasher.update(b"{");
                hasher.update((map.len() as u64).to_be_bytes());
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort_unstable();
                for key in keys {
                    hasher.update((key.len() as u64).to_be_bytes());
                    hasher.update(key.as_bytes());
                    Self::update_value(hasher, &map[key]);
                }
            }
        }
    }
}
