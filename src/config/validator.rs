//! Validation of resource documents.
//!
//! Field-level checks come from the `validator` derive on the schema types;
//! cross-resource checks (unique ids, known dependencies, no cycles) live here.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;
use validator::Validate;

use super::spec::ResourceDocument;

/// Validator for resource documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl DocumentValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a resource document, collecting every problem found.
    #[must_use]
    pub fn validate(&self, doc: &ResourceDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        if doc.is_empty() {
            result.warnings.push(String::from("No resources declared"));
        }

        Self::validate_fields(doc, &mut result);
        Self::validate_identities(doc, &mut result);
        Self::validate_dependencies(doc, &mut result);

        if result.errors.is_empty() {
            if let Err(cycle) = self.dependency_order(doc) {
                result.errors.push(ValidationError {
                    field: String::from("resources"),
                    message: format!("circular dependency between: {}", cycle.join(", ")),
                });
            }
        }

        debug!(
            "Validated {} resources: {} errors, {} warnings",
            doc.resources.len(),
            result.errors.len(),
            result.warnings.len()
        );
        result
    }

    /// Returns resource indices in dependency order.
    ///
    /// Dependencies always come before their dependents; independent
    /// resources keep their declaration order.
    ///
    /// # Errors
    ///
    /// Returns the ids left unordered when the dependencies contain a cycle.
    pub fn dependency_order(&self, doc: &ResourceDocument) -> Result<Vec<usize>, Vec<String>> {
        let nodes: Vec<(&str, &[String])> = doc
            .resources
            .iter()
            .map(|r| (r.id.as_str(), r.depends_on.as_slice()))
            .collect();
        topological_order(&nodes)
    }

    /// Runs the derived field validators.
    fn validate_fields(doc: &ResourceDocument, result: &mut ValidationResult) {
        for (i, resource) in doc.resources.iter().enumerate() {
            if let Err(errors) = resource.validate() {
                for (field, field_errors) in errors.field_errors() {
                    for error in field_errors {
                        let message = error
                            .message
                            .as_ref()
                            .map_or_else(|| error.code.to_string(), ToString::to_string);
                        result.errors.push(ValidationError {
                            field: format!("resources[{i}].{field}"),
                            message,
                        });
                    }
                }
            }
        }
    }

    /// Checks id format and uniqueness.
    fn validate_identities(doc: &ResourceDocument, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, resource) in doc.resources.iter().enumerate() {
            if !resource.id.is_empty() && !is_valid_id(&resource.id) {
                result.errors.push(ValidationError {
                    field: format!("resources[{i}].id"),
                    message: format!(
                        "id '{}' is invalid. Must be lowercase alphanumeric with '-', '_' or '.'",
                        resource.id
                    ),
                });
            }

            if !seen.insert(resource.id.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("resources[{i}].id"),
                    message: format!("duplicate resource id: {}", resource.id),
                });
            }
        }
    }

    /// Checks that every dependency names a declared resource.
    fn validate_dependencies(doc: &ResourceDocument, result: &mut ValidationResult) {
        let declared: HashSet<&str> = doc.resources.iter().map(|r| r.id.as_str()).collect();

        for (i, resource) in doc.resources.iter().enumerate() {
            let mut seen = HashSet::new();
            for (j, dep) in resource.depends_on.iter().enumerate() {
                if !declared.contains(dep.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("resources[{i}].depends_on[{j}]"),
                        message: format!("'{}' depends on undeclared resource '{dep}'", resource.id),
                    });
                }
                if !seen.insert(dep.as_str()) {
                    result.warnings.push(format!(
                        "resources[{i}].depends_on[{j}]: '{dep}' listed more than once"
                    ));
                }
            }
        }
    }
}

/// Orders nodes so that every node follows the nodes it depends on.
///
/// Ties are broken by input position. Dependencies on ids that are not in
/// `nodes` are ignored.
///
/// # Errors
///
/// Returns the ids that could not be ordered because of a cycle.
pub fn topological_order(nodes: &[(&str, &[String])]) -> Result<Vec<usize>, Vec<String>> {
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();

    let mut pending = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, (_, deps)) in nodes.iter().enumerate() {
        let unique: BTreeSet<usize> = deps.iter().filter_map(|d| index.get(d.as_str()).copied()).collect();
        pending[i] = unique.len();
        for dep in unique {
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.into_iter().collect();
        Err((0..nodes.len())
            .filter(|i| !placed.contains(i))
            .map(|i| nodes[i].0.to_string())
            .collect())
    }
}

/// Validates that an id follows the naming convention.
/// Ids are lowercase alphanumeric plus '-', '_' and '.', starting with a letter or digit.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Joins all errors into a single line.
    #[must_use]
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
