//! Change calculation between desired and applied state.
//!
//! The planner only needs an ordered list of changes; how that list is
//! derived is behind the [`ChangeCalculator`] trait. [`DiffEngine`] is the
//! built-in calculator for the `resources:` document format.

use std::collections::HashSet;
use tracing::debug;

use crate::config::{
    topological_order, ContentHasher, DocumentValidator, ResourceDescriptor, ResourceDocument, ResourceSpec,
};
use crate::error::PlanError;
use crate::store::{InfraState, ResourceRecord};

use super::plan::{ChangeAction, PlannedChange};

/// Computes the changes needed to move the applied state to a descriptor.
#[cfg_attr(test, mockall::automock)]
pub trait ChangeCalculator: Send + Sync + std::fmt::Debug {
    /// Returns the changes in the order they must be executed.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Generation`] if the descriptor cannot be turned
    /// into a change set.
    fn calculate(
        &self,
        descriptor: &ResourceDescriptor,
        state: &InfraState,
    ) -> Result<Vec<PlannedChange>, PlanError>;
}

/// Engine for computing diffs between declared resources and applied state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Content hasher.
    hasher: ContentHasher,
    /// Document validator.
    validator: DocumentValidator,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ContentHasher::new(),
            validator: DocumentValidator::new(),
        }
    }

    /// Parses and validates the descriptor's document.
    fn document(&self, descriptor: &ResourceDescriptor) -> Result<ResourceDocument, PlanError> {
        let source = descriptor.source_name();

        let document: ResourceDocument = if descriptor.document().is_null() {
            ResourceDocument::default()
        } else {
            serde_yaml::from_value(descriptor.document().clone())
                .map_err(|e| PlanError::generation(source, e.to_string()))?
        };

        let result = self.validator.validate(&document);
        for warning in &result.warnings {
            debug!("{source}: {warning}");
        }
        if !result.is_valid() {
            return Err(PlanError::generation(source, result.summary()));
        }

        Ok(document)
    }

    /// Builds the delete change for a recorded resource.
    fn delete(record: &ResourceRecord, reason: String) -> PlannedChange {
        PlannedChange {
            resource_id: record.id.clone(),
            resource_kind: record.kind.clone(),
            action: ChangeAction::Delete,
            depends_on: record.depends_on.clone(),
            before: Some(serde_json::Value::Object(record.properties.clone())),
            after: None,
            reason,
        }
    }

    /// Diffs one declared resource against its record.
    fn compare(&self, spec: &ResourceSpec, record: Option<&ResourceRecord>) -> Option<PlannedChange> {
        let change = |action, before, reason: String| PlannedChange {
            resource_id: spec.id.clone(),
            resource_kind: spec.kind.clone(),
            action,
            depends_on: spec.depends_on.clone(),
            before,
            after: Some(spec.desired_state()),
            reason,
        };

        let Some(record) = record else {
            return Some(change(ChangeAction::Create, None, String::from("declared but not applied")));
        };

        if record.kind != spec.kind {
            return Some(change(
                ChangeAction::Create,
                None,
                format!("kind changed from {} to {}", record.kind, spec.kind),
            ));
        }

        let before = Some(serde_json::Value::Object(record.properties.clone()));
        if record.hash != self.hasher.hash_resource(&spec.kind, &spec.properties) {
            return Some(change(ChangeAction::Update, before, String::from("properties changed")));
        }
        if record.depends_on != spec.depends_on {
            return Some(change(ChangeAction::Update, before, String::from("dependencies changed")));
        }

        None
    }
}

impl ChangeCalculator for DiffEngine {
    fn calculate(
        &self,
        descriptor: &ResourceDescriptor,
        state: &InfraState,
    ) -> Result<Vec<PlannedChange>, PlanError> {
        let document = self.document(descriptor)?;
        let source = descriptor.source_name();

        let order = self
            .validator
            .dependency_order(&document)
            .map_err(|cycle| {
                PlanError::generation(source, format!("circular dependency between: {}", cycle.join(", ")))
            })?;

        // A kept resource that drops its dependency on a removed one is updated
        // before that removal, as long as everything it still depends on is
        // already in its final shape.
        let removed: HashSet<&str> = state
            .resources
            .keys()
            .map(String::as_str)
            .filter(|id| document.get(id).is_none())
            .collect();
        let mut settled: HashSet<&str> = HashSet::new();
        let mut detaching = Vec::new();
        let mut remaining = Vec::new();

        for i in order {
            let spec = &document.resources[i];
            let record = state.get(&spec.id);
            let Some(change) = self.compare(spec, record) else {
                settled.insert(spec.id.as_str());
                continue;
            };

            let detaches = change.action == ChangeAction::Update
                && record.is_some_and(|r| r.depends_on.iter().any(|d| removed.contains(d.as_str())));
            if detaches && spec.depends_on.iter().all(|d| settled.contains(d.as_str())) {
                settled.insert(spec.id.as_str());
                detaching.push(change);
            } else {
                remaining.push(change);
            }
        }

        let mut changes = detaching;

        // Then deletes, dependents before their dependencies.
        let records: Vec<&ResourceRecord> = state.resources.values().collect();
        let nodes: Vec<(&str, &[String])> = records
            .iter()
            .map(|r| (r.id.as_str(), r.depends_on.as_slice()))
            .collect();
        let record_order = topological_order(&nodes).unwrap_or_else(|cycle| {
            debug!("Recorded dependencies are cyclic ({}), deleting in id order", cycle.join(", "));
            (0..records.len()).collect()
        });

        for &i in record_order.iter().rev() {
            let record = records[i];
            match document.get(&record.id) {
                None => changes.push(Self::delete(record, String::from("no longer declared"))),
                Some(spec) if spec.kind != record.kind => changes.push(Self::delete(
                    record,
                    format!("kind changed from {} to {}", record.kind, spec.kind),
                )),
                Some(_) => {}
            }
        }

        changes.extend(remaining);

        debug!(
            "{source}: {} declared, {} recorded, {} changes",
            document.resources.len(),
            state.resources.len(),
            changes.len()
        );

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(yaml: &str) -> ResourceDescriptor {
        ResourceDescriptor::from_bytes("web.iac.yaml", yaml.as_bytes().to_vec()).unwrap()
    }

    fn applied(yaml: &str) -> InfraState {
        let engine = DiffEngine::new();
        let mut state = InfraState::new();
        for change in engine.calculate(&descriptor(yaml), &InfraState::new()).unwrap() {
            state.record(&change, "previous");
        }
        state
    }

    fn summary(changes: &[PlannedChange]) -> Vec<String> {
        changes
            .iter()
            .map(|c| format!("{} {}", c.action, c.resource_id))
            .collect()
    }

    const BASE: &str = r"
resources:
  - id: web
    kind: vm
    depends_on: [network]
    properties: {size: small}
  - id: network
    kind: vpc
    properties: {cidr: 10.0.0.0/16}
";

    #[test]
    fn test_creates_in_dependency_order() {
        let changes = DiffEngine::new()
            .calculate(&descriptor(BASE), &InfraState::new())
            .unwrap();
        assert_eq!(summary(&changes), vec!["create network", "create web"]);
        assert_eq!(changes[1].after, Some(serde_json::json!({"size": "small"})));
    }

    #[test]
    fn test_unchanged_resources_produce_no_changes() {
        let state = applied(BASE);
        let changes = DiffEngine::new().calculate(&descriptor(BASE), &state).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_property_change_is_update() {
        let state = applied(BASE);
        let changed = BASE.replace("size: small", "size: large");
        let changes = DiffEngine::new().calculate(&descriptor(&changed), &state).unwrap();

        assert_eq!(summary(&changes), vec!["update web"]);
        assert_eq!(changes[0].before, Some(serde_json::json!({"size": "small"})));
        assert_eq!(changes[0].after, Some(serde_json::json!({"size": "large"})));
    }

    #[test]
    fn test_removed_resources_deleted_dependents_first() {
        let state = applied(BASE);
        let changes = DiffEngine::new()
            .calculate(&descriptor("resources: []"), &state)
            .unwrap();
        assert_eq!(summary(&changes), vec!["delete web", "delete network"]);
    }

    #[test]
    fn test_dropped_dependency_updated_before_delete() {
        let state = applied(BASE);
        let changed = r"
resources:
  - id: web
    kind: vm
    properties: {size: small}
";
        let changes = DiffEngine::new().calculate(&descriptor(changed), &state).unwrap();

        assert_eq!(summary(&changes), vec!["update web", "delete network"]);
        assert_eq!(changes[0].reason, "dependencies changed");
        assert!(changes[0].depends_on.is_empty());
    }

    #[test]
    fn test_detaching_update_waits_for_changed_dependency() {
        let state = applied(BASE);
        let changed = r"
resources:
  - id: web
    kind: vm
    depends_on: [subnet]
    properties: {size: small}
  - id: subnet
    kind: subnet
";
        let changes = DiffEngine::new().calculate(&descriptor(changed), &state).unwrap();

        assert_eq!(summary(&changes), vec!["delete network", "create subnet", "update web"]);
    }

    #[test]
    fn test_kind_change_is_delete_then_create() {
        let state = applied(BASE);
        let changed = BASE.replace("kind: vm", "kind: container");
        let changes = DiffEngine::new().calculate(&descriptor(&changed), &state).unwrap();
        assert_eq!(summary(&changes), vec!["delete web", "create web"]);
        assert_eq!(changes[1].resource_kind, "container");
    }

    #[test]
    fn test_empty_file_deletes_everything() {
        let state = applied(BASE);
        let changes = DiffEngine::new().calculate(&descriptor(""), &state).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.action == ChangeAction::Delete));
    }

    #[test]
    fn test_invalid_document_fails_generation() {
        let err = DiffEngine::new()
            .calculate(
                &descriptor("resources:\n  - {id: web, kind: vm, depends_on: [db]}\n"),
                &InfraState::new(),
            )
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("web.iac.yaml"));
        assert!(message.contains("undeclared resource 'db'"));
    }

    #[test]
    fn test_wrong_shape_fails_generation() {
        let err = DiffEngine::new()
            .calculate(&descriptor("- just\n- a list\n"), &InfraState::new())
            .unwrap_err();
        assert!(matches!(err, PlanError::Generation { .. }));
    }
}
