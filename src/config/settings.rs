//! Resolved runtime settings.
//!
//! Flags, environment variables and the `.env` file are resolved once at the
//! CLI boundary into a [`Settings`] value; the core only ever sees this struct.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use validator::Validate;

use crate::error::{ConfigError, Result};
use crate::store::{LocalBackend, S3Backend, StorageBackend};

/// Default directory for the local store.
pub const DEFAULT_STORE_DIR: &str = ".iac";

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Local filesystem directory.
    #[default]
    Local,
    /// S3 bucket shared between machines.
    S3,
}

/// Settings shared by every command.
#[derive(Debug, Clone, Validate)]
pub struct Settings {
    /// Which backend holds plans and applied state.
    pub backend: BackendKind,
    /// Root directory for the local backend.
    pub store_dir: PathBuf,
    /// S3 bucket (required for the S3 backend).
    #[validate(length(min = 3, max = 63, message = "bucket names are 3-63 characters"))]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[validate(length(max = 512))]
    pub prefix: Option<String>,
    /// S3 region (uses the AWS default chain if unset).
    pub region: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            bucket: None,
            prefix: None,
            region: None,
        }
    }
}

impl Settings {
    /// Checks that the settings are complete and consistent.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is malformed or the S3 backend has no bucket.
    pub fn check(&self) -> Result<()> {
        if let Err(errors) = self.validate() {
            let (field, message) = errors
                .field_errors()
                .into_iter()
                .next()
                .map(|(field, errs)| {
                    let message = errs
                        .first()
                        .and_then(|e| e.message.as_ref())
                        .map_or_else(|| String::from("invalid value"), ToString::to_string);
                    (field.to_string(), message)
                })
                .unwrap_or_else(|| (String::from("settings"), errors.to_string()));
            return Err(ConfigError::invalid(field, message).into());
        }

        if self.backend == BackendKind::S3 && self.bucket.is_none() {
            return Err(ConfigError::MissingValue {
                name: String::from("--bucket"),
            }
            .into());
        }

        Ok(())
    }

    /// Opens the configured storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid.
    pub async fn open_backend(&self) -> Result<Arc<dyn StorageBackend>> {
        self.check()?;

        match self.backend {
            BackendKind::Local => {
                debug!("Using local store at {}", self.store_dir.display());
                Ok(Arc::new(LocalBackend::new(&self.store_dir)))
            }
            BackendKind::S3 => {
                let bucket = self.bucket.as_deref().unwrap_or_default();
                let backend =
                    S3Backend::new(bucket, self.prefix.as_deref(), self.region.as_deref()).await;
                Ok(Arc::new(backend))
            }
        }
    }
}

/// Loads a `.env` file from `dir` if one exists.
///
/// Values already present in the process environment win.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_dotenv(dir: &Path) -> Result<()> {
    let env_path = dir.join(".env");

    if env_path.exists() {
        info!("Loading environment from: {}", env_path.display());
        dotenvy::from_path(&env_path).map_err(|e| ConfigError::Dotenv {
            path: env_path.clone(),
            message: e.to_string(),
        })?;
    } else {
        debug!(".env file not found at: {}", env_path.display());
    }

    Ok(())
}
