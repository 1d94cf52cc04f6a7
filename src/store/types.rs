//! Applied-state types.
//!
//! The applied state is what the diff engine compares desired resources
//! against, and what the apply executor updates after each successful change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::config::ContentHasher;
use crate::planner::{ChangeAction, PlannedChange};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete applied state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraState {
    /// State format version.
    pub version: String,
    /// Incremented on every recorded change.
    pub serial: u64,
    /// Applied resources by id.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// What was last applied for one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: String,
    /// Applied properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Dependencies at the time of apply.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Content hash of kind and properties.
    pub hash: String,
    /// Plan that last touched this resource.
    pub plan: String,
    /// When the change was applied.
    pub applied_at: DateTime<Utc>,
}

/// Summary of one apply run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyHistoryEntry {
    /// Plan identifier.
    pub plan: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Number of changes that succeeded.
    pub succeeded: usize,
    /// Number of changes that failed.
    pub failed: usize,
    /// Number of changes that were skipped.
    pub skipped: usize,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

impl Default for InfraState {
    fn default() -> Self {
        Self::new()
    }
}

impl InfraState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource record by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    /// Records a successfully applied change and bumps the serial.
    pub fn record(&mut self, change: &PlannedChange, plan: &str) {
        match change.action {
            ChangeAction::Create | ChangeAction::Update => {
                let properties = match &change.after {
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                };
                let record = ResourceRecord {
                    id: change.resource_id.clone(),
                    kind: change.resource_kind.clone(),
                    hash: ContentHasher::new().hash_resource(&change.resource_kind, &properties),
                    properties,
                    depends_on: change.depends_on.clone(),
                    plan: plan.to_string(),
                    applied_at: Utc::now(),
                };
                self.resources.insert(record.id.clone(), record);
            }
            ChangeAction::Delete => {
                self.resources.remove(&change.resource_id);
            }
        }
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}
