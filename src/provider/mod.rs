//! Infrastructure providers.
//!
//! A provider performs one planned change against real infrastructure. The
//! apply executor drives it change by change and owns ordering, timeouts and
//! cancellation; a provider only has to do the work and report the outcome.

mod command;
mod logging;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::planner::PlannedChange;

pub use command::CommandProvider;
pub use logging::LoggingProvider;

/// Applies planned changes to real infrastructure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InfraProvider: Send + Sync {
    /// Short provider name for logs and reports.
    fn name(&self) -> &'static str;

    /// Applies a single change.
    ///
    /// The future may be dropped before it completes when the change times
    /// out; implementations must not leave background work running.
    async fn apply_change(&self, change: &PlannedChange) -> Result<(), ProviderError>;
}
