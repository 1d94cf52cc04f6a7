//! Resource descriptor loading.
//!
//! The loader resolves the path the user passed to `plan`, tells a missing
//! file apart from an unreadable or malformed one, and exposes the parsed
//! document to the planner. It never interprets the document's schema.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ResourceError, Result};

/// A resource file read once for a single `plan` invocation.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Path as supplied by the caller.
    path: PathBuf,
    /// File name component of the path.
    source_name: String,
    /// Raw file contents.
    raw: Vec<u8>,
    /// Parsed YAML document.
    document: serde_yaml::Value,
}

/// Loader for resource descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceLoader;

impl ResourceDescriptor {
    /// Builds a descriptor from a path and its raw contents.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Invalid`] if the contents are not well-formed YAML.
    pub fn from_bytes(path: impl Into<PathBuf>, raw: Vec<u8>) -> Result<Self> {
        let path = path.into();
        let source_name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        let document = if raw.iter().all(u8::is_ascii_whitespace) {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_slice(&raw).map_err(|e| ResourceError::Invalid {
                path: path.clone(),
                message: e.to_string(),
            })?
        };

        Ok(Self {
            path,
            source_name,
            raw,
            document,
        })
    }

    /// Returns the path as supplied by the caller.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file name the plan is named after.
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Returns the raw file contents.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the parsed document.
    #[must_use]
    pub const fn document(&self) -> &serde_yaml::Value {
        &self.document
    }
}

impl ResourceLoader {
    /// Creates a new resource loader.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Loads and parses a resource file.
    ///
    /// # Errors
    ///
    /// - [`ResourceError::NotFound`] when the path does not exist.
    /// - [`ResourceError::Unreadable`] when it exists but cannot be read.
    /// - [`ResourceError::Invalid`] when it is not well-formed YAML.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<ResourceDescriptor> {
        let path = path.as_ref();
        info!("Loading resource file: {}", path.display());

        let metadata = fs::metadata(path).await.map_err(|e| classify(path, &e))?;
        if metadata.is_dir() {
            return Err(ResourceError::Unreadable {
                path: path.to_path_buf(),
                message: String::from("is a directory"),
            }
            .into());
        }

        let raw = fs::read(path).await.map_err(|e| classify(path, &e))?;
        debug!("Read {} bytes from {}", raw.len(), path.display());

        ResourceDescriptor::from_bytes(path, raw)
    }
}

/// Maps an I/O error to not-found or unreadable.
fn classify(path: &Path, err: &std::io::Error) -> ResourceError {
    if err.kind() == ErrorKind::NotFound {
        ResourceError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        ResourceError::Unreadable {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
