//! Plan generation.
//!
//! Turns a resource descriptor into a sealed [`PlanArtifact`] and persists
//! it. Nothing is written unless the change set was computed in full.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ResourceDescriptor;
use crate::error::{PlanError, Result};
use crate::store::{PlanStore, StateStore};

use super::diff::{ChangeCalculator, DiffEngine};
use super::naming::{Clock, PlanName, SystemClock};
use super::plan::PlanArtifact;

/// Generator for plan artifacts.
#[derive(Debug, Clone)]
pub struct PlanGenerator {
    /// Where artifacts are persisted.
    plans: PlanStore,
    /// Applied state the changes are computed against.
    state: StateStore,
    /// Change set computation.
    calculator: Arc<dyn ChangeCalculator>,
    /// Source of the plan timestamp.
    clock: Arc<dyn Clock>,
}

impl PlanGenerator {
    /// Creates a generator using the built-in diff engine and the system clock.
    #[must_use]
    pub fn new(plans: PlanStore, state: StateStore) -> Self {
        Self {
            plans,
            state,
            calculator: Arc::new(DiffEngine::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the change calculator.
    #[must_use]
    pub fn with_calculator(mut self, calculator: Arc<dyn ChangeCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    /// Generates and stores a plan for a descriptor.
    ///
    /// # Errors
    ///
    /// - [`PlanError::Generation`] if the change set cannot be computed; no
    ///   artifact is written in that case.
    /// - [`PlanError::InvalidName`] if no name can be derived from the file name.
    /// - Any store error while reading state or writing the artifact.
    pub async fn generate(&self, descriptor: &ResourceDescriptor) -> Result<PlanArtifact> {
        let source = descriptor.source_name();
        let name = PlanName::for_source(source, self.clock.now())?;
        info!("Generating plan {name} from {}", descriptor.path().display());

        let state = self.state.load().await?;
        let changes = self.calculator.calculate(descriptor, &state)?;
        debug!("Computed {} changes against state serial {}", changes.len(), state.serial);

        let artifact = PlanArtifact::new(
            &name,
            descriptor.path().display().to_string(),
            state.serial,
            changes,
        )
        .map_err(|e| PlanError::generation(source, format!("cannot seal plan: {e}")))?;

        self.plans.put(&artifact).await?;
        Ok(artifact)
    }
}
