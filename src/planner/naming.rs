//! Plan artifact naming.
//!
//! A plan is named `<resource>_<timestamp>.plan.sw.json`, where `<resource>`
//! is the resource file name without its recognized suffix and `<timestamp>`
//! is the creation instant in RFC 3339 UTC with second precision. Names sort
//! by resource, then by time.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::PlanError;

/// Suffix of every plan artifact name.
pub const PLAN_SUFFIX: &str = ".plan.sw.json";

/// Resource file suffixes stripped when deriving the base name, longest first.
pub const RESOURCE_SUFFIXES: [&str; 4] = [".iac.yaml", ".iac.yml", ".yaml", ".yml"];

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    /// Seconds since the Unix epoch.
    secs: AtomicI64,
}

impl FixedClock {
    /// Creates a clock stopped at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            secs: AtomicI64::new(at.timestamp()),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.secs.load(Ordering::SeqCst), 0)
            .single()
            .unwrap_or_default()
    }
}

/// The parsed form of a plan artifact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanName {
    /// Resource base name.
    resource: String,
    /// Creation instant, truncated to whole seconds.
    created_at: DateTime<Utc>,
}

impl PlanName {
    /// Builds a plan name from a resource base name and an instant.
    ///
    /// # Errors
    ///
    /// Returns an error if the base name is empty or not usable as a file name.
    pub fn new(resource: impl Into<String>, created_at: DateTime<Utc>) -> Result<Self, PlanError> {
        let resource = resource.into();
        check_base_name(&resource).map_err(|reason| PlanError::invalid_name(&resource, reason))?;

        let created_at = Utc
            .timestamp_opt(created_at.timestamp(), 0)
            .single()
            .unwrap_or(created_at);

        Ok(Self {
            resource,
            created_at,
        })
    }

    /// Builds a plan name for a resource file name such as `web.iac.yaml`.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is left of the file name once the suffix
    /// is stripped.
    pub fn for_source(source_name: &str, created_at: DateTime<Utc>) -> Result<Self, PlanError> {
        Self::new(resource_base_name(source_name), created_at)
    }

    /// Parses a plan artifact name.
    ///
    /// Only canonical names are accepted, so a parsed name always renders
    /// back to the exact input.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidName`] if `name` does not follow the convention.
    pub fn parse(name: &str) -> Result<Self, PlanError> {
        let stem = name
            .strip_suffix(PLAN_SUFFIX)
            .ok_or_else(|| PlanError::invalid_name(name, format!("must end with {PLAN_SUFFIX}")))?;

        let (resource, timestamp) = stem.rsplit_once('_').ok_or_else(|| {
            PlanError::invalid_name(name, "expected <resource>_<timestamp> before the suffix")
        })?;

        let created_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| PlanError::invalid_name(name, format!("bad timestamp \"{timestamp}\": {e}")))?
            .with_timezone(&Utc);

        let parsed = Self::new(resource, created_at).map_err(|_| {
            PlanError::invalid_name(name, "resource part is empty or contains a path separator")
        })?;

        if parsed.timestamp() != timestamp {
            return Err(PlanError::invalid_name(
                name,
                "timestamp must be UTC with second precision (YYYY-MM-DDTHH:MM:SSZ)",
            ));
        }

        Ok(parsed)
    }

    /// Returns the resource base name.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the creation instant.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the timestamp part of the name.
    #[must_use]
    pub fn timestamp(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl std::fmt::Display for PlanName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}{PLAN_SUFFIX}", self.resource, self.timestamp())
    }
}

impl std::str::FromStr for PlanName {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Strips the first recognized resource suffix from a file name.
#[must_use]
pub fn resource_base_name(source_name: &str) -> &str {
    RESOURCE_SUFFIXES
        .iter()
        .find_map(|suffix| source_name.strip_suffix(suffix))
        .unwrap_or(source_name)
}

/// Checks that a plan identifier is safe to use as a storage key.
///
/// This is weaker than [`PlanName::parse`]: lookups of well-formed but
/// unknown names must report "not found", not "invalid".
///
/// # Errors
///
/// Returns [`PlanError::InvalidName`] for empty names, names with path
/// separators and hidden names.
pub fn check_identifier(identifier: &str) -> Result<(), PlanError> {
    if identifier.is_empty() {
        return Err(PlanError::invalid_name(identifier, "plan name is empty"));
    }
    if identifier.contains(['/', '\\']) {
        return Err(PlanError::invalid_name(identifier, "plan name contains a path separator"));
    }
    if identifier.starts_with('.') {
        return Err(PlanError::invalid_name(identifier, "plan name starts with '.'"));
    }
    Ok(())
}

/// Validates a resource base name.
fn check_base_name(resource: &str) -> Result<(), &'static str> {
    if resource.is_empty() {
        return Err("resource name is empty");
    }
    if resource.contains(['/', '\\']) {
        return Err("resource name contains a path separator");
    }
    if resource.starts_with('.') {
        return Err("resource name starts with '.'");
    }
    Ok(())
}
