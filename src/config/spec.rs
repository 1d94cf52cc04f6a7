//! Resource document schema understood by the built-in diff engine.
//!
//! These types map to the contents of a `*.iac.yaml` file. The loader itself
//! treats the file as an opaque YAML document; only the diff engine converts
//! it into these structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

/// The root of a resource file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct ResourceDocument {
    /// Declared resources, in declaration order.
    #[serde(default)]
    #[validate(nested)]
    pub resources: Vec<ResourceSpec>,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    /// Unique identifier within the document.
    #[validate(length(min = 1, max = 128, message = "id must be 1-128 characters"))]
    pub id: String,
    /// Provider-defined resource kind (e.g. "vm", "vpc").
    #[validate(length(min = 1, max = 64, message = "kind must be 1-64 characters"))]
    pub kind: String,
    /// Identifiers of resources that must exist before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired properties. Opaque to the planner beyond hashing.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ResourceDocument {
    /// Returns the resource with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Returns true if the document declares no resources.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl ResourceSpec {
    /// Returns the desired state as the payload stored in a plan.
    #[must_use]
    pub fn desired_state(&self) -> Value {
        Value::Object(self.properties.clone())
    }
}
