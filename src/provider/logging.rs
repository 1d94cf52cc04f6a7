//! Provider that only reports what it would do.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::error::ProviderError;
use crate::planner::PlannedChange;

use super::InfraProvider;

/// Logs each change and reports success.
///
/// Useful for dry runs and for exercising the apply workflow without
/// touching real infrastructure.
#[derive(Debug, Default, Clone)]
pub struct LoggingProvider {
    /// Simulated time taken by each change.
    latency: Option<Duration>,
}

impl LoggingProvider {
    /// Creates a provider that returns immediately.
    #[must_use]
    pub const fn new() -> Self {
        Self { latency: None }
    }

    /// Makes every change take `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl InfraProvider for LoggingProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn apply_change(&self, change: &PlannedChange) -> Result<(), ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        info!("{}", change.description());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ChangeAction;

    fn change() -> PlannedChange {
        PlannedChange {
            resource_id: String::from("web"),
            resource_kind: String::from("vm"),
            action: ChangeAction::Create,
            depends_on: vec![],
            before: None,
            after: None,
            reason: String::new(),
        }
    }

    #[tokio::test]
    async fn test_always_succeeds() {
        let provider = LoggingProvider::new();
        assert_eq!(provider.name(), "log");
        assert!(provider.apply_change(&change()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_latency() {
        let provider = LoggingProvider::new().with_latency(Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        provider.apply_change(&change()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
