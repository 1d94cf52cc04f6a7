//! Plan artifact store.
//!
//! Artifacts live under `plans/` in the backend, one object per plan, keyed by
//! the plan name. They are written once and never modified.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{IacError, PlanError, Result, StoreError};
use crate::planner::{check_identifier, PlanArtifact, PlanName};

use super::backend::StorageBackend;

/// Key prefix for plan artifacts.
const PLANS_PREFIX: &str = "plans/";

/// Store for plan artifacts.
#[derive(Debug, Clone)]
pub struct PlanStore {
    /// Underlying blob storage.
    backend: Arc<dyn StorageBackend>,
}

impl PlanStore {
    /// Creates a plan store over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Returns the store location, for diagnostics.
    #[must_use]
    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Gets the backend key for a plan identifier.
    fn key(identifier: &str) -> String {
        format!("{PLANS_PREFIX}{identifier}")
    }

    /// Persists a new artifact.
    ///
    /// # Errors
    ///
    /// - [`PlanError::InvalidName`] if the artifact name is not canonical.
    /// - [`StoreError::AlreadyExists`] if a plan with this name is stored.
    /// - Any backend error.
    pub async fn put(&self, artifact: &PlanArtifact) -> Result<()> {
        let name = PlanName::parse(&artifact.name)?;
        if name.to_string() != artifact.name {
            return Err(PlanError::invalid_name(&artifact.name, "name is not canonical").into());
        }

        let content = serde_json::to_vec_pretty(artifact)
            .map_err(|e| StoreError::serialization(format!("Failed to serialize plan: {e}")))?;

        match self.backend.create(&Self::key(&artifact.name), &content).await {
            Ok(()) => {
                info!(
                    "Stored plan {} ({} changes) in {}",
                    artifact.name,
                    artifact.change_count(),
                    self.backend.location()
                );
                Ok(())
            }
            Err(IacError::Store(StoreError::AlreadyExists { .. })) => Err(StoreError::AlreadyExists {
                identifier: artifact.name.clone(),
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    /// Reads the stored bytes of a plan.
    ///
    /// Repeated reads return identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown identifiers.
    pub async fn get_raw(&self, identifier: &str) -> Result<Vec<u8>> {
        check_identifier(identifier)?;

        self.backend
            .get(&Self::key(identifier))
            .await?
            .ok_or_else(|| {
                StoreError::NotFound {
                    identifier: identifier.to_string(),
                }
                .into()
            })
    }

    /// Reads and verifies a plan.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] for unknown identifiers.
    /// - [`StoreError::Corrupted`] if the artifact cannot be parsed, its
    ///   checksum does not match or it was stored under another name.
    pub async fn get(&self, identifier: &str) -> Result<PlanArtifact> {
        let content = self.get_raw(identifier).await?;

        let artifact: PlanArtifact = serde_json::from_slice(&content)
            .map_err(|e| StoreError::corrupted(identifier, format!("Failed to parse plan: {e}")))?;

        artifact
            .verify()
            .map_err(|message| StoreError::corrupted(identifier, message))?;

        if artifact.name != identifier {
            return Err(StoreError::corrupted(
                identifier,
                format!("artifact is named \"{}\"", artifact.name),
            )
            .into());
        }

        debug!("Loaded plan {identifier} ({} changes)", artifact.change_count());
        Ok(artifact)
    }

    /// Checks whether a plan exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is unsafe or the backend fails.
    pub async fn exists(&self, identifier: &str) -> Result<bool> {
        check_identifier(identifier)?;
        self.backend.exists(&Self::key(identifier)).await
    }

    /// Lists stored plans, sorted by resource and then by time.
    ///
    /// Objects that do not follow the naming convention are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot list objects.
    pub async fn list(&self) -> Result<Vec<PlanName>> {
        let mut names: Vec<PlanName> = self
            .backend
            .list(PLANS_PREFIX)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(PLANS_PREFIX))
            .filter_map(|identifier| match PlanName::parse(identifier) {
                Ok(name) => Some(name),
                Err(e) => {
                    debug!("Ignoring stray object in plan store: {e}");
                    None
                }
            })
            .collect();

        names.sort();
        Ok(names)
    }
}
