// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![warn(dead_code)]                   // Unused code is flagged
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # iacplan
//!
//! A two-phase infrastructure-as-code engine: **plan** now, **apply** later.
//!
//! ## Overview
//!
//! Planning reads a resource file, computes the ordered list of changes needed
//! to reach the declared state, and writes them as an immutable, uniquely
//! named plan artifact. Applying loads that exact artifact, possibly hours
//! later and on another machine, and executes its changes in stored order.
//!
//! ## Architecture
//!
//! 1. **Resource Descriptor Loader**: reads and parses the resource file
//! 2. **Plan Generator**: names the plan and computes the change set
//! 3. **Plan Store**: write-once persistence of plan artifacts
//! 4. **Apply Executor**: fail-fast execution with per-change outcomes
//!
//! ## Modules
//!
//! - [`config`]: Resource loading, settings, validation and hashing
//! - [`planner`]: Plan naming, diffing, generation and execution
//! - [`store`]: Storage backends, the plan store and the applied state
//! - [`provider`]: Infrastructure providers that carry out changes
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - id: network
//!     kind: vpc
//!     properties:
//!       cidr: 10.0.0.0/16
//!   - id: web
//!     kind: vm
//!     depends_on: [network]
//!     properties:
//!       size: small
//! ```
//!
//! `iac plan --resource web.iac.yaml` prints an identifier such as
//! `web_2024-01-01T00:00:00Z.plan.sw.json`, which is then passed to
//! `iac apply --plan`.

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod store;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ContentHasher, DocumentValidator, ResourceDescriptor, ResourceLoader, Settings};
pub use error::{IacError, Result};
pub use planner::{
    ApplyExecutor, ApplyOptions, ApplyReport, CancelHandle, CancelSignal, ChangeCalculator,
    DiffEngine, FailurePolicy, PlanArtifact, PlanGenerator, PlanName, PlannedChange,
};
pub use provider::{CommandProvider, InfraProvider, LoggingProvider};
pub use store::{InfraState, LocalBackend, PlanStore, S3Backend, StateStore, StorageBackend};
