//! Configuration module.
//!
//! This module handles everything the planner reads from the outside world:
//! - Loading resource files into descriptors
//! - The resource document schema and its validation
//! - Content hashing for change detection
//! - Runtime settings resolved at the CLI boundary

mod hash;
mod resource;
mod settings;
mod spec;
mod validator;

pub use hash::ContentHasher;
pub use resource::{ResourceDescriptor, ResourceLoader};
pub use settings::{load_dotenv, BackendKind, Settings, DEFAULT_STORE_DIR};
pub use spec::{ResourceDocument, ResourceSpec};
pub use validator::{topological_order, DocumentValidator, ValidationError, ValidationResult};
