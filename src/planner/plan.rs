//! Plan artifact types.
//!
//! A [`PlanArtifact`] is the durable, reviewable record of what `apply` will
//! do. Its change list is sealed with a checksum when the plan is created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ContentHasher;

use super::naming::PlanName;

/// Current plan format version.
pub const PLAN_FORMAT_VERSION: u32 = 1;

/// An immutable record of intended changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanArtifact {
    /// Plan format version.
    pub format_version: u32,
    /// Artifact identifier (`<resource>_<timestamp>.plan.sw.json`).
    pub name: String,
    /// Resource base name.
    pub resource_name: String,
    /// Resource file path the plan was generated from.
    pub source_path: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Applied-state serial this plan was computed against.
    pub state_serial: u64,
    /// Changes in execution order.
    pub changes: Vec<PlannedChange>,
    /// SHA-256 of the change list.
    pub checksum: String,
}

/// A single intended change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedChange {
    /// Target resource id.
    pub resource_id: String,
    /// Target resource kind.
    pub resource_kind: String,
    /// What to do.
    pub action: ChangeAction,
    /// Dependencies declared for the resource.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Recorded state before the change.
    #[serde(default)]
    pub before: Option<Value>,
    /// Desired state after the change.
    #[serde(default)]
    pub after: Option<Value>,
    /// Why the change is needed.
    #[serde(default)]
    pub reason: String,
}

/// Types of changes in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

impl PlanArtifact {
    /// Creates a sealed artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the change list cannot be serialized.
    pub fn new(
        name: &PlanName,
        source_path: impl Into<String>,
        state_serial: u64,
        changes: Vec<PlannedChange>,
    ) -> Result<Self, serde_json::Error> {
        // Seal the changes exactly as they will read back from storage.
        let changes: Vec<PlannedChange> = serde_json::from_slice(&serde_json::to_vec(&changes)?)?;
        let checksum = ContentHasher::new().checksum(&changes)?;
        Ok(Self {
            format_version: PLAN_FORMAT_VERSION,
            name: name.to_string(),
            resource_name: name.resource().to_string(),
            source_path: source_path.into(),
            created_at: name.created_at(),
            state_serial,
            changes,
            checksum,
        })
    }

    /// Checks the format version and that the change list matches its checksum.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn verify(&self) -> Result<(), String> {
        if self.format_version != PLAN_FORMAT_VERSION {
            return Err(format!(
                "unsupported plan format version {} (expected {PLAN_FORMAT_VERSION})",
                self.format_version
            ));
        }

        let actual = ContentHasher::new()
            .checksum(&self.changes)
            .map_err(|e| format!("cannot hash changes: {e}"))?;
        if actual != self.checksum {
            return Err(format!(
                "checksum mismatch (recorded {}, computed {actual})",
                self.checksum
            ));
        }

        Ok(())
    }

    /// Returns true if the plan has no changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of changes.
    #[must_use]
    pub const fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Returns the number of changes of one kind.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }
}

impl PlannedChange {
    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ChangeAction::Create => format!("Create {} '{}'", self.resource_kind, self.resource_id),
            ChangeAction::Update => format!("Update {} '{}'", self.resource_kind, self.resource_id),
            ChangeAction::Delete => format!("Delete {} '{}'", self.resource_kind, self.resource_id),
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.resource_id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.changes.is_empty() {
            return write!(f, "{}: no changes", self.name);
        }

        writeln!(f, "{} ({} changes):", self.name, self.changes.len())?;
        for (i, change) in self.changes.iter().enumerate() {
            writeln!(f, "  {}. {change}", i + 1)?;
        }
        Ok(())
    }
}
