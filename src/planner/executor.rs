//! Plan executor for applying stored plans.
//!
//! Changes run one at a time in the order recorded in the plan. Each change
//! moves from `Pending` to `InProgress` and ends `Succeeded` or `Failed`;
//! changes that never start end `Skipped`. Successful changes are written to
//! the applied state immediately, so progress survives a crash mid-run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, Result};
use crate::provider::InfraProvider;
use crate::store::{ApplyHistoryEntry, InfraState, LockInfo, PlanStore, StateStore};

use super::plan::{ChangeAction, PlanArtifact, PlannedChange};

/// What to do when a change fails.
///
/// The default is [`FailurePolicy::FailFast`]. Changes that already
/// succeeded are never rolled back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first failed change; the rest are skipped.
    #[default]
    FailFast,
    /// Keep applying the remaining changes after a failure.
    ContinueOnError,
}

/// Options for an apply run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Failure policy.
    pub policy: FailurePolicy,
    /// Limit for a single change.
    pub change_timeout: Option<Duration>,
    /// Limit for the whole run.
    pub run_timeout: Option<Duration>,
}

/// Lifecycle of a single change within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Not started yet.
    Pending,
    /// Handed to the provider.
    InProgress,
    /// Applied and recorded.
    Succeeded,
    /// The provider failed, timed out, or the result could not be recorded.
    Failed,
    /// Never started.
    Skipped,
}

/// Why a change failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The provider reported an error.
    Provider,
    /// The change exceeded its time limit.
    Timeout,
    /// The change was applied but the applied state could not be saved.
    Recording,
}

/// Outcome of a single change.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    /// Position in the plan.
    pub index: usize,
    /// Target resource id.
    pub resource_id: String,
    /// Target resource kind.
    pub resource_kind: String,
    /// Change action.
    pub action: ChangeAction,
    /// Final status.
    pub status: ChangeStatus,
    /// Failure cause, for failed changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    /// Error message, for failed changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent on the change in milliseconds.
    pub duration_ms: u64,
}

/// Result of applying one plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Plan identifier.
    pub plan: String,
    /// Provider that performed the changes.
    pub provider: String,
    /// Failure policy in effect.
    pub policy: FailurePolicy,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Per-change outcomes in plan order.
    pub outcomes: Vec<ChangeOutcome>,
    /// Whether every change succeeded.
    pub success: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether the run deadline was hit.
    pub timed_out: bool,
}

/// Requests cancellation of an apply run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    /// Cancellation flag sender.
    tx: Arc<watch::Sender<bool>>,
}

/// Observes cancellation requests.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    /// Cancellation flag receiver.
    rx: watch::Receiver<bool>,
}

/// Creates a connected cancellation handle and signal.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

impl CancelHandle {
    /// Requests cancellation. The change in progress is allowed to finish.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that is never raised.
    #[must_use]
    pub fn never() -> Self {
        cancel_pair().1
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Watches interrupts produced by `next`.
///
/// The first interrupt cancels the run through `cancel`. Returns `true` when
/// a second interrupt arrives, at which point the caller should quit without
/// waiting for the change in progress, and `false` if `next` fails first.
pub async fn handle_interrupts<F, Fut>(cancel: CancelHandle, mut next: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next().await.is_err() {
        return false;
    }
    warn!("Interrupt received; stopping after the current change (interrupt again to quit now)");
    cancel.cancel();

    if next().await.is_err() {
        return false;
    }
    warn!("Second interrupt received; quitting now, the state lock stays until it expires");
    true
}

/// A failed provider call.
struct ChangeFailure {
    /// Why it failed.
    cause: FailureCause,
    /// What happened.
    message: String,
    /// Whether the run deadline, not the change limit, was hit.
    run_deadline: bool,
}

/// Executor for stored plans.
#[derive(Clone)]
pub struct ApplyExecutor {
    /// Where plans are read from.
    plans: PlanStore,
    /// Applied state and lock.
    state: StateStore,
    /// Performs the changes.
    provider: Arc<dyn InfraProvider>,
    /// Run options.
    options: ApplyOptions,
    /// External cancellation.
    cancel: CancelSignal,
}

impl std::fmt::Debug for ApplyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("plans", &self.plans)
            .field("state", &self.state)
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ApplyExecutor {
    /// Creates a new executor with default options.
    #[must_use]
    pub fn new(plans: PlanStore, state: StateStore, provider: Arc<dyn InfraProvider>) -> Self {
        Self {
            plans,
            state,
            provider,
            options: ApplyOptions::default(),
            cancel: CancelSignal::never(),
        }
    }

    /// Sets the run options.
    #[must_use]
    pub const fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the cancellation signal.
    #[must_use]
    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies a stored plan.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if no plan has this identifier. The provider
    ///   is not called.
    /// - [`ApplyError::NotApplicable`] if the applied state changed since the
    ///   plan was generated. The provider is not called.
    /// - `StoreError::LockedByOther` if another apply is running.
    /// - [`ApplyError::ExecutionFailed`], [`ApplyError::Timeout`],
    ///   [`ApplyError::Cancelled`] or [`ApplyError::LockLost`] with the full
    ///   report once execution started.
    pub async fn apply(&self, identifier: &str) -> Result<ApplyReport> {
        let artifact = self.plans.get(identifier).await?;
        info!(
            "Applying plan {} ({} changes) with provider {}",
            artifact.name,
            artifact.change_count(),
            self.provider.name()
        );

        let mut lock = self.state.acquire_lock(Some(identifier)).await?;
        let result = self.apply_locked(&artifact, &mut lock).await;

        if let Err(e) = self.state.release_lock(&lock).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }

        result
    }

    /// Runs the plan while holding the state lock.
    ///
    /// The lock is renewed before every change; `lock` always holds the
    /// latest renewal.
    async fn apply_locked(&self, artifact: &PlanArtifact, lock: &mut LockInfo) -> Result<ApplyReport> {
        let mut state = self.state.load().await?;
        if state.serial != artifact.state_serial {
            return Err(ApplyError::NotApplicable {
                plan: artifact.name.clone(),
                reason: format!(
                    "it was generated against state serial {} but the applied state is at serial {}; generate a new plan",
                    artifact.state_serial, state.serial
                ),
            }
            .into());
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = self.options.run_timeout.map(|limit| start + limit);
        let total = artifact.changes.len();

        let mut outcomes: Vec<ChangeOutcome> = artifact
            .changes
            .iter()
            .enumerate()
            .map(|(index, change)| ChangeOutcome::pending(index, change))
            .collect();
        let mut cancelled = false;
        let mut timed_out = false;
        let mut lock_lost: Option<String> = None;

        for (index, change) in artifact.changes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Apply cancelled, skipping {} remaining changes", total - index);
                cancelled = true;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Run deadline reached, skipping {} remaining changes", total - index);
                timed_out = true;
                break;
            }
            match self.state.renew_lock(lock).await {
                Ok(renewed) => *lock = renewed,
                Err(e) => {
                    error!("Lost the state lock, skipping {} remaining changes: {e}", total - index);
                    lock_lost = Some(e.to_string());
                    break;
                }
            }

            let outcome = &mut outcomes[index];
            outcome.status = ChangeStatus::InProgress;
            info!("[{}/{total}] {}", index + 1, change.description());

            let change_start = Instant::now();
            let result = self.run_change(change, deadline).await;
            outcome.duration_ms = elapsed_ms(change_start);

            match result {
                Ok(()) => {
                    let mut next = state.clone();
                    next.record(change, &artifact.name);
                    match self.state.save(&next).await {
                        Ok(()) => {
                            state = next;
                            outcome.status = ChangeStatus::Succeeded;
                            debug!("{} succeeded in {}ms", change.resource_id, outcome.duration_ms);
                        }
                        Err(e) => {
                            error!("{} was applied but could not be recorded: {e}", change.resource_id);
                            outcome.fail(FailureCause::Recording, format!("applied but not recorded: {e}"));
                            break;
                        }
                    }
                }
                Err(failure) => {
                    error!("{} failed: {}", change.resource_id, failure.message);
                    outcome.fail(failure.cause, failure.message);
                    if failure.run_deadline {
                        timed_out = true;
                        break;
                    }
                    if self.options.policy == FailurePolicy::FailFast {
                        break;
                    }
                }
            }
        }

        for outcome in &mut outcomes {
            if outcome.status == ChangeStatus::Pending {
                outcome.status = ChangeStatus::Skipped;
            }
        }

        let mut report = ApplyReport {
            plan: artifact.name.clone(),
            provider: self.provider.name().to_string(),
            policy: self.options.policy,
            started_at,
            duration_ms: elapsed_ms(start),
            outcomes,
            success: false,
            cancelled,
            timed_out,
        };
        report.success = report.failed() == 0 && report.skipped() == 0;

        // The state now belongs to whoever holds the lock.
        if lock_lost.is_none() {
            self.record_history(&mut state, &report).await;
        }
        info!("{report}");

        let plan = artifact.name.clone();
        let report = Box::new(report);
        if let Some(message) = lock_lost {
            Err(ApplyError::LockLost {
                plan,
                message,
                report,
            }
            .into())
        } else if timed_out {
            let limit_secs = self.options.run_timeout.map_or(0, |t| t.as_secs());
            Err(ApplyError::Timeout {
                plan,
                limit_secs,
                report,
            }
            .into())
        } else if cancelled {
            Err(ApplyError::Cancelled { plan, report }.into())
        } else if !report.success {
            Err(ApplyError::ExecutionFailed { plan, report }.into())
        } else {
            Ok(*report)
        }
    }

    /// Hands one change to the provider under the applicable time limit.
    async fn run_change(
        &self,
        change: &PlannedChange,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), ChangeFailure> {
        let run_left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let limit = match (self.options.change_timeout, run_left) {
            (Some(change_limit), Some(left)) if left < change_limit => Some((left, true)),
            (Some(change_limit), _) => Some((change_limit, false)),
            (None, Some(left)) => Some((left, true)),
            (None, None) => None,
        };

        let call = self.provider.apply_change(change);
        let result = match limit {
            None => call.await,
            Some((limit, run_deadline)) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ChangeFailure {
                        cause: FailureCause::Timeout,
                        message: if run_deadline {
                            String::from("run deadline reached while the change was in progress")
                        } else {
                            format!("timed out after {}", format_duration(limit))
                        },
                        run_deadline,
                    });
                }
            },
        };

        result.map_err(|e| ChangeFailure {
            cause: FailureCause::Provider,
            message: e.to_string(),
            run_deadline: false,
        })
    }

    /// Appends the run to the state history. Failures are logged, not raised.
    async fn record_history(&self, state: &mut InfraState, report: &ApplyReport) {
        state.add_history(ApplyHistoryEntry {
            plan: report.plan.clone(),
            timestamp: Utc::now(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            skipped: report.skipped(),
            success: report.success,
            error: report
                .outcomes
                .iter()
                .find_map(|o| o.error.clone()),
        });

        if let Err(e) = self.state.save(state).await {
            warn!("Failed to record apply history: {e}");
        }
    }
}

impl ChangeOutcome {
    /// Creates a pending outcome for a change.
    fn pending(index: usize, change: &PlannedChange) -> Self {
        Self {
            index,
            resource_id: change.resource_id.clone(),
            resource_kind: change.resource_kind.clone(),
            action: change.action,
            status: ChangeStatus::Pending,
            cause: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Marks the change as failed.
    fn fail(&mut self, cause: FailureCause, message: String) {
        self.status = ChangeStatus::Failed;
        self.cause = Some(cause);
        self.error = Some(message);
    }
}

impl ApplyReport {
    /// Number of changes that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(ChangeStatus::Succeeded)
    }

    /// Number of changes that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ChangeStatus::Failed)
    }

    /// Number of changes that were skipped.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(ChangeStatus::Skipped)
    }

    /// Run duration.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Counts outcomes with a given status.
    fn count(&self, status: ChangeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provider => "provider",
            Self::Timeout => "timeout",
            Self::Recording => "recording",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FailFast => "fail-fast",
            Self::ContinueOnError => "continue-on-error",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied {} changes in {}: {} succeeded, {} failed, {} skipped",
            self.outcomes.len(),
            format_duration(self.duration()),
            self.succeeded(),
            self.failed(),
            self.skipped()
        )
    }
}

/// Milliseconds elapsed since `start`, saturating.
fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Formats a duration as seconds with millisecond precision.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDescriptor;
    use crate::error::{IacError, ProviderError, StoreError};
    use crate::planner::naming::FixedClock;
    use crate::planner::PlanGenerator;
    use crate::provider::{LoggingProvider, MockInfraProvider};
    use crate::store::{LocalBackend, StorageBackend};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const THREE: &str = r"
resources:
  - {id: a, kind: vm}
  - {id: b, kind: vm}
  - {id: c, kind: vm}
";

    /// Provider with per-resource behaviour that records every call.
    #[derive(Default)]
    struct ScriptedProvider {
        calls: Mutex<Vec<String>>,
        fail: HashSet<String>,
        slow: HashMap<String, Duration>,
        cancel_during: Option<(String, CancelHandle)>,
        steal_lock_during: Option<(String, Arc<FlakyBackend>)>,
    }

    impl ScriptedProvider {
        fn failing(ids: &[&str]) -> Self {
            Self {
                fail: ids.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InfraProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn apply_change(&self, change: &PlannedChange) -> std::result::Result<(), ProviderError> {
            self.calls.lock().unwrap().push(change.resource_id.clone());
            if let Some((id, handle)) = &self.cancel_during
                && *id == change.resource_id
            {
                handle.cancel();
            }
            if let Some((id, backend)) = &self.steal_lock_during
                && *id == change.resource_id
            {
                let foreign = LockInfo::new("other-host", None);
                backend
                    .replace("state.lock", &serde_json::to_vec(&foreign).unwrap())
                    .await
                    .unwrap();
            }
            if let Some(delay) = self.slow.get(&change.resource_id) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail.contains(&change.resource_id) {
                return Err(ProviderError::failed(&change.resource_id, "boom"));
            }
            Ok(())
        }
    }

    /// Local backend whose state writes can be made to fail.
    #[derive(Debug)]
    struct FlakyBackend {
        inner: LocalBackend,
        fail_state_writes: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn create(&self, key: &str, content: &[u8]) -> Result<()> {
            self.inner.create(key, content).await
        }
        async fn replace(&self, key: &str, content: &[u8]) -> Result<()> {
            if key == "state.json" && self.fail_state_writes.load(Ordering::SeqCst) {
                return Err(StoreError::s3("disk full").into());
            }
            self.inner.replace(key, content).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        fn backend_type(&self) -> &'static str {
            "flaky"
        }
        fn location(&self) -> String {
            self.inner.location()
        }
    }

    struct Fixture {
        plans: PlanStore,
        state: StateStore,
        backend: Arc<FlakyBackend>,
        _temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let backend = Arc::new(FlakyBackend {
                inner: LocalBackend::new(temp.path()),
                fail_state_writes: AtomicBool::new(false),
            });
            Self {
                plans: PlanStore::new(backend.clone()),
                state: StateStore::new(backend.clone()),
                backend,
                _temp: temp,
            }
        }

        async fn plan(&self, yaml: &str) -> PlanArtifact {
            let clock = Arc::new(FixedClock::new(Utc::now()));
            PlanGenerator::new(self.plans.clone(), self.state.clone())
                .with_clock(clock)
                .generate(&ResourceDescriptor::from_bytes("web.iac.yaml", yaml.as_bytes().to_vec()).unwrap())
                .await
                .unwrap()
        }

        fn executor(&self, provider: Arc<dyn InfraProvider>) -> ApplyExecutor {
            ApplyExecutor::new(self.plans.clone(), self.state.clone(), provider)
        }
    }

    fn statuses(report: &ApplyReport) -> Vec<ChangeStatus> {
        report.outcomes.iter().map(|o| o.status).collect()
    }

    #[tokio::test]
    async fn test_missing_plan_is_not_found_without_provider_calls() {
        let fixture = Fixture::new();
        let mut provider = MockInfraProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_apply_change().never();

        let err = fixture
            .executor(Arc::new(provider))
            .apply("missing.plan.sw.json")
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(err.to_string().contains("missing.plan.sw.json"));
    }

    #[tokio::test]
    async fn test_applies_in_stored_order_and_records_state() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider::default());

        let report = fixture.executor(provider.clone()).apply(&plan.name).await.unwrap();

        assert!(report.success);
        assert_eq!(provider.calls(), vec!["a", "b", "c"]);
        assert_eq!(statuses(&report), vec![ChangeStatus::Succeeded; 3]);

        let state = fixture.state.load().await.unwrap();
        assert_eq!(state.serial, 3);
        assert_eq!(state.resource_ids(), vec!["a", "b", "c"]);
        assert_eq!(state.get("a").unwrap().plan, plan.name);
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);
        assert!(!fixture.state.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_provider_called_once_per_change() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;

        let mut provider = MockInfraProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_apply_change().times(3).returning(|_| Ok(()));

        let report = fixture.executor(Arc::new(provider)).apply(&plan.name).await.unwrap();
        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.provider, "mock");
    }

    #[tokio::test]
    async fn test_first_failure_skips_the_rest() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider::failing(&["a"]));

        let err = fixture.executor(provider.clone()).apply(&plan.name).await.unwrap_err();

        assert_eq!(provider.calls(), vec!["a"]);
        let report = err.report().unwrap();
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Failed, ChangeStatus::Skipped, ChangeStatus::Skipped]
        );
        assert_eq!(report.outcomes[0].cause, Some(FailureCause::Provider));
        assert!(matches!(err, IacError::Apply(ApplyError::ExecutionFailed { .. })));
        assert!(err.to_string().contains("0 succeeded, 1 failed, 2 skipped"));
        assert!(!fixture.state.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_successes_before_failure_are_kept() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider::failing(&["b"]));

        let err = fixture.executor(provider).apply(&plan.name).await.unwrap_err();

        let report = err.report().unwrap();
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Succeeded, ChangeStatus::Failed, ChangeStatus::Skipped]
        );
        let state = fixture.state.load().await.unwrap();
        assert_eq!(state.resource_ids(), vec!["a"]);
        assert!(!state.history[0].success);
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider::failing(&["a"]));

        let err = fixture
            .executor(provider.clone())
            .with_options(ApplyOptions {
                policy: FailurePolicy::ContinueOnError,
                ..ApplyOptions::default()
            })
            .apply(&plan.name)
            .await
            .unwrap_err();

        assert_eq!(provider.calls(), vec!["a", "b", "c"]);
        let report = err.report().unwrap();
        assert_eq!(report.policy, FailurePolicy::ContinueOnError);
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Failed, ChangeStatus::Succeeded, ChangeStatus::Succeeded]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_timeout_fails_change() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider {
            slow: HashMap::from([(String::from("b"), Duration::from_secs(60))]),
            ..ScriptedProvider::default()
        });

        let err = fixture
            .executor(provider)
            .with_options(ApplyOptions {
                change_timeout: Some(Duration::from_secs(5)),
                ..ApplyOptions::default()
            })
            .apply(&plan.name)
            .await
            .unwrap_err();

        assert!(matches!(err, IacError::Apply(ApplyError::ExecutionFailed { .. })));
        let report = err.report().unwrap();
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Succeeded, ChangeStatus::Failed, ChangeStatus::Skipped]
        );
        assert_eq!(report.outcomes[1].cause, Some(FailureCause::Timeout));
        assert!(report.outcomes[1].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_stops_even_when_continuing() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider {
            slow: HashMap::from([(String::from("a"), Duration::from_secs(60))]),
            ..ScriptedProvider::default()
        });

        let err = fixture
            .executor(provider.clone())
            .with_options(ApplyOptions {
                policy: FailurePolicy::ContinueOnError,
                run_timeout: Some(Duration::from_secs(10)),
                ..ApplyOptions::default()
            })
            .apply(&plan.name)
            .await
            .unwrap_err();

        assert!(matches!(err, IacError::Apply(ApplyError::Timeout { limit_secs: 10, .. })));
        assert_eq!(provider.calls(), vec!["a"]);
        let report = err.report().unwrap();
        assert!(report.timed_out);
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Failed, ChangeStatus::Skipped, ChangeStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn test_cancel_lets_current_change_finish() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let (handle, signal) = cancel_pair();
        let provider = Arc::new(ScriptedProvider {
            cancel_during: Some((String::from("a"), handle)),
            ..ScriptedProvider::default()
        });

        let err = fixture
            .executor(provider.clone())
            .with_cancel_signal(signal)
            .apply(&plan.name)
            .await
            .unwrap_err();

        assert!(matches!(err, IacError::Apply(ApplyError::Cancelled { .. })));
        assert_eq!(provider.calls(), vec!["a"]);
        let report = err.report().unwrap();
        assert!(report.cancelled);
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Succeeded, ChangeStatus::Skipped, ChangeStatus::Skipped]
        );
        assert!(!fixture.state.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_plan_rejected() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider::default());
        let executor = fixture.executor(provider.clone());

        executor.apply(&plan.name).await.unwrap();
        let err = executor.apply(&plan.name).await.unwrap_err();

        assert!(matches!(err, IacError::Apply(ApplyError::NotApplicable { .. })));
        assert_eq!(provider.calls().len(), 3);
        assert!(!fixture.state.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_state_rejected_without_provider_calls() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let _held = fixture.state.acquire_lock(None).await.unwrap();
        let provider = Arc::new(ScriptedProvider::default());

        let err = fixture.executor(provider.clone()).apply(&plan.name).await.unwrap_err();

        assert!(matches!(err, IacError::Store(StoreError::LockedByOther { .. })));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_recording_failure_halts_run() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        fixture.backend.fail_state_writes.store(true, Ordering::SeqCst);
        let provider = Arc::new(ScriptedProvider::default());

        let err = fixture
            .executor(provider.clone())
            .with_options(ApplyOptions {
                policy: FailurePolicy::ContinueOnError,
                ..ApplyOptions::default()
            })
            .apply(&plan.name)
            .await
            .unwrap_err();

        assert_eq!(provider.calls(), vec!["a"]);
        let report = err.report().unwrap();
        assert_eq!(report.outcomes[0].cause, Some(FailureCause::Recording));
        assert_eq!(
            statuses(report),
            vec![ChangeStatus::Failed, ChangeStatus::Skipped, ChangeStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn test_lost_lock_stops_run_and_leaves_new_holder_alone() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;
        let provider = Arc::new(ScriptedProvider {
            steal_lock_during: Some((String::from("a"), fixture.backend.clone())),
            ..ScriptedProvider::default()
        });

        let err = fixture.executor(provider.clone()).apply(&plan.name).await.unwrap_err();

        assert!(matches!(err, IacError::Apply(ApplyError::LockLost { .. })));
        assert_eq!(provider.calls(), vec!["a"]);
        assert_eq!(
            statuses(err.report().unwrap()),
            vec![ChangeStatus::Succeeded, ChangeStatus::Skipped, ChangeStatus::Skipped]
        );

        let lock = fixture.state.get_lock_info().await.unwrap().unwrap();
        assert_eq!(lock.holder, "other-host");

        let state = fixture.state.load().await.unwrap();
        assert_eq!(state.resource_ids(), vec!["a"]);
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn test_lock_renewed_between_changes() {
        let fixture = Fixture::new();
        let plan = fixture.plan(THREE).await;

        // Start from a lock that is one second from expiry.
        let mut lock = fixture.state.acquire_lock(Some(&plan.name)).await.unwrap();
        lock.expires_at = Utc::now() + chrono::Duration::seconds(1);
        fixture
            .backend
            .replace("state.lock", &serde_json::to_vec(&lock).unwrap())
            .await
            .unwrap();

        let executor = fixture.executor(Arc::new(ScriptedProvider::default()));
        let artifact = fixture.plans.get(&plan.name).await.unwrap();
        let report = executor.apply_locked(&artifact, &mut lock).await.unwrap();

        assert!(report.success);
        assert!(lock.remaining_secs() > crate::store::LOCK_EXPIRY_SECS - 5);
        assert_eq!(fixture.state.get_lock_info().await.unwrap().unwrap(), lock);
    }

    #[tokio::test]
    async fn test_empty_plan_is_successful_noop() {
        let fixture = Fixture::new();
        let plan = fixture.plan("resources: []").await;
        assert!(plan.is_empty());

        let report = fixture
            .executor(Arc::new(LoggingProvider::new()))
            .apply(&plan.name)
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.outcomes.is_empty());
    }

    fn interrupts(events: Vec<std::io::Result<()>>) -> impl FnMut() -> std::future::Ready<std::io::Result<()>> {
        let mut events = events.into_iter();
        move || {
            std::future::ready(
                events
                    .next()
                    .unwrap_or_else(|| Err(std::io::Error::other("signal stream closed"))),
            )
        }
    }

    #[tokio::test]
    async fn test_second_interrupt_requests_exit() {
        let (handle, signal) = cancel_pair();
        assert!(handle_interrupts(handle, interrupts(vec![Ok(()), Ok(())])).await);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_single_interrupt_only_cancels() {
        let (handle, signal) = cancel_pair();
        assert!(!handle_interrupts(handle, interrupts(vec![Ok(())])).await);
        assert!(signal.is_cancelled());

        let (handle, signal) = cancel_pair();
        assert!(!handle_interrupts(handle, interrupts(vec![])).await);
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_cancel_signal() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(signal.clone().is_cancelled());
        assert!(!CancelSignal::never().is_cancelled());
    }
}
