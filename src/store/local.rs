//! Local file-based storage backend.
//!
//! Keys map to paths under a root directory. New objects are written to a
//! uniquely named temporary file and committed with a hard link, which fails
//! if the target exists; replacements are committed with a rename.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};

use super::backend::StorageBackend;

/// Local file-based storage backend.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    /// Root directory of the store.
    root: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolves a key to a path under the root.
    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Ensures the parent directory of `path` exists.
    async fn ensure_parent(key: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, &e))?;
        }
        Ok(())
    }

    /// Writes `content` to a fresh temporary file next to `target` and syncs it.
    async fn write_temp(key: &str, target: &Path, content: &[u8]) -> Result<PathBuf> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StoreError::io(key, &e))?;

        let written = async {
            file.write_all(content).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            Self::discard_temp(&temp_path).await;
            return Err(StoreError::io(key, &e).into());
        }

        Ok(temp_path)
    }

    /// Removes a temporary file, logging failures.
    async fn discard_temp(temp_path: &Path) {
        if let Err(e) = fs::remove_file(temp_path).await {
            warn!("Failed to remove temporary file {}: {e}", temp_path.display());
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match fs::read(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No object at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(StoreError::io(key, &e).into()),
        }
    }

    async fn create(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path(key);
        Self::ensure_parent(key, &path).await?;

        let temp_path = Self::write_temp(key, &path, content).await?;

        // The link fails if the target exists, so the first writer wins.
        let linked = fs::hard_link(&temp_path, &path).await;
        Self::discard_temp(&temp_path).await;

        match linked {
            Ok(()) => {
                debug!("Created {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::AlreadyExists {
                identifier: key.to_string(),
            }
            .into()),
            Err(e) => Err(StoreError::io(key, &e).into()),
        }
    }

    async fn replace(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path(key);
        Self::ensure_parent(key, &path).await?;

        let temp_path = Self::write_temp(key, &path, content).await?;

        if let Err(e) = fs::rename(&temp_path, &path).await {
            Self::discard_temp(&temp_path).await;
            return Err(StoreError::io(key, &e).into());
        }

        debug!("Replaced {}", path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, &e).into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        fs::try_exists(self.path(key))
            .await
            .map_err(|e| StoreError::io(key, &e).into())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir_key, name_prefix) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let dir = self.path(dir_key);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(prefix, &e).into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(prefix, &e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(name_prefix) {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(prefix, &e))?
                .is_file();
            if is_file {
                keys.push(if dir_key.is_empty() {
                    name
                } else {
                    format!("{dir_key}/{name}")
                });
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}
