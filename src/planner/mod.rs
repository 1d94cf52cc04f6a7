//! Planning and apply workflow.
//!
//! This module turns resource descriptors into immutable plan artifacts and
//! later executes those artifacts against real infrastructure.

mod diff;
mod executor;
mod generator;
mod naming;
mod plan;

pub use diff::{ChangeCalculator, DiffEngine};
pub use executor::{
    cancel_pair, format_duration, handle_interrupts, ApplyExecutor, ApplyOptions, ApplyReport, CancelHandle, CancelSignal,
    ChangeOutcome, ChangeStatus, FailureCause, FailurePolicy,
};
pub use generator::PlanGenerator;
pub use naming::{
    check_identifier, resource_base_name, Clock, FixedClock, PlanName, SystemClock, PLAN_SUFFIX,
    RESOURCE_SUFFIXES,
};
pub use plan::{ChangeAction, PlanArtifact, PlannedChange, PLAN_FORMAT_VERSION};
