//! Error types for the plan/apply workflow.
//!
//! Each phase of the workflow owns an error enum: loading resource files,
//! generating plans, persisting artifacts, executing plans and talking to
//! infrastructure providers. They all fold into [`IacError`], which is what
//! the public API returns.

use std::path::PathBuf;
use thiserror::Error;

use crate::planner::ApplyReport;

/// The main error type for the plan/apply workflow.
#[derive(Debug, Error)]
pub enum IacError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource descriptor errors.
    #[error("{0}")]
    Resource(#[from] ResourceError),

    /// Plan generation and naming errors.
    #[error("{0}")]
    Plan(#[from] PlanError),

    /// Plan and state store errors.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Apply execution errors.
    #[error("{0}")]
    Apply(#[from] ApplyError),

    /// Command output could not be written.
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was not supplied by flag or environment.
    #[error("missing required value: {name}")]
    MissingValue {
        /// Name of the missing flag.
        name: String,
    },

    /// A supplied value is invalid.
    #[error("invalid value for {field}: {message}")]
    Invalid {
        /// Field that failed validation.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// The .env file could not be loaded.
    #[error("failed to load {path}: {message}")]
    Dotenv {
        /// Path to the .env file.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// Errors raised while loading a resource descriptor.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The resource file does not exist.
    #[error("resource file \"{}\" not found", path.display())]
    NotFound {
        /// Path as supplied by the caller.
        path: PathBuf,
    },

    /// The resource file exists but could not be read.
    #[error("resource file \"{}\" is not readable: {message}", path.display())]
    Unreadable {
        /// Path as supplied by the caller.
        path: PathBuf,
        /// Underlying cause.
        message: String,
    },

    /// The resource file was read but is not a well-formed document.
    #[error("resource file \"{}\" is malformed: {message}", path.display())]
    Invalid {
        /// Path as supplied by the caller.
        path: PathBuf,
        /// Parser message.
        message: String,
    },
}

/// Plan generation and identification errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The descriptor could not be turned into a change set.
    #[error("cannot generate a plan for \"{resource}\": {message}")]
    Generation {
        /// Resource file name.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// A plan identifier does not follow the naming convention.
    #[error("\"{name}\" is not a valid plan name: {reason}")]
    InvalidName {
        /// The rejected identifier.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Persistence errors for plan artifacts and applied state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object is stored under this identifier.
    #[error("plan \"{identifier}\" not found")]
    NotFound {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// An object already exists under this identifier.
    #[error("plan \"{identifier}\" already exists and will not be overwritten")]
    AlreadyExists {
        /// The colliding identifier.
        identifier: String,
    },

    /// Local filesystem failure.
    #[error("storage I/O error on \"{key}\": {message}")]
    Io {
        /// Object key being accessed.
        key: String,
        /// Underlying cause.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 storage error: {message}")]
    S3 {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// A stored object failed integrity checks.
    #[error("\"{key}\" is corrupted: {message}")]
    Corrupted {
        /// Object key.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// Lock acquisition failed.
    #[error("failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The applied state is locked by another process.
    #[error("state is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },
}

/// Apply execution errors.
///
/// Every variant raised after execution started carries the full
/// [`ApplyReport`], so callers can show exactly which changes succeeded before
/// the run stopped.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The plan no longer matches the applied state it was computed against.
    #[error("plan \"{plan}\" is no longer applicable: {reason}")]
    NotApplicable {
        /// Plan identifier.
        plan: String,
        /// Why it was rejected.
        reason: String,
    },

    /// One or more changes failed.
    #[error(
        "apply of plan \"{plan}\" failed: {} succeeded, {} failed, {} skipped",
        .report.succeeded(), .report.failed(), .report.skipped()
    )]
    ExecutionFailed {
        /// Plan identifier.
        plan: String,
        /// Per-change outcomes.
        report: Box<ApplyReport>,
    },

    /// The run exceeded its deadline.
    #[error("apply of plan \"{plan}\" timed out after {limit_secs}s")]
    Timeout {
        /// Plan identifier.
        plan: String,
        /// Configured run deadline in seconds.
        limit_secs: u64,
        /// Per-change outcomes.
        report: Box<ApplyReport>,
    },

    /// The run was cancelled externally.
    #[error(
        "apply of plan \"{plan}\" was cancelled: {} succeeded, {} skipped",
        .report.succeeded(), .report.skipped()
    )]
    Cancelled {
        /// Plan identifier.
        plan: String,
        /// Per-change outcomes.
        report: Box<ApplyReport>,
    },

    /// The state lock was lost while the run was in progress.
    #[error("apply of plan \"{plan}\" stopped: {message}")]
    LockLost {
        /// Plan identifier.
        plan: String,
        /// How the lock was lost.
        message: String,
        /// Per-change outcomes.
        report: Box<ApplyReport>,
    },
}

/// Errors reported by an infrastructure provider for a single change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider attempted the change and it failed.
    #[error("{resource}: {message}")]
    Failed {
        /// Resource the change targeted.
        resource: String,
        /// Provider message.
        message: String,
    },
}

/// Result type alias for plan/apply operations.
pub type Result<T> = std::result::Result<T, IacError>;

impl IacError {
    /// Returns true if a resource file or plan artifact was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Resource(ResourceError::NotFound { .. }) | Self::Store(StoreError::NotFound { .. })
        )
    }

    /// Returns the apply report carried by this error, if any.
    #[must_use]
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            Self::Apply(
                ApplyError::ExecutionFailed { report, .. }
                | ApplyError::Timeout { report, .. }
                | ApplyError::Cancelled { report, .. }
                | ApplyError::LockLost { report, .. },
            ) => Some(report),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates an invalid-value error for a specific field.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl PlanError {
    /// Creates a generation error for a resource.
    #[must_use]
    pub fn generation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generation {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-name error.
    #[must_use]
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl StoreError {
    /// Creates an I/O error for an object key.
    #[must_use]
    pub fn io(key: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3 {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a corruption error for an object key.
    #[must_use]
    pub fn corrupted(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a failure for a resource.
    #[must_use]
    pub fn failed(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let missing_resource = IacError::from(ResourceError::NotFound {
            path: PathBuf::from("web.iac.yaml"),
        });
        let missing_plan = IacError::from(StoreError::NotFound {
            identifier: String::from("missing.plan.sw.json"),
        });
        let unreadable = IacError::from(ResourceError::Unreadable {
            path: PathBuf::from("web.iac.yaml"),
            message: String::from("permission denied"),
        });

        assert!(missing_resource.is_not_found());
        assert!(missing_plan.is_not_found());
        assert!(!unreadable.is_not_found());
    }

    #[test]
    fn test_messages_name_the_subject() {
        let err = IacError::from(ResourceError::NotFound {
            path: PathBuf::from("web.iac.yaml"),
        });
        let message = err.to_string();
        assert!(message.contains("web.iac.yaml"));
        assert!(message.contains("not found"));

        let err = IacError::from(StoreError::NotFound {
            identifier: String::from("missing.plan.sw.json"),
        });
        assert!(err.to_string().contains("missing.plan.sw.json"));
    }
}
