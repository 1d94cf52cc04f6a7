//! Provider that hands each change to a user command.
//!
//! The hook runs through `sh -c` with the change described in environment
//! variables and as JSON on stdin. A zero exit status means the change was
//! applied.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProviderError;
use crate::planner::PlannedChange;

use super::InfraProvider;

/// Longest stderr excerpt kept in a failure message.
const MAX_STDERR_CHARS: usize = 500;

/// Runs a shell command per change.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    /// Shell command line.
    hook: String,
}

impl CommandProvider {
    /// Creates a provider that runs `hook` for every change.
    #[must_use]
    pub fn new(hook: impl Into<String>) -> Self {
        Self { hook: hook.into() }
    }
}

#[async_trait]
impl InfraProvider for CommandProvider {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn apply_change(&self, change: &PlannedChange) -> Result<(), ProviderError> {
        let resource = change.resource_id.as_str();
        let payload = serde_json::to_vec(change)
            .map_err(|e| ProviderError::failed(resource, format!("cannot encode change: {e}")))?;

        debug!("Running hook for {}: {}", change.description(), self.hook);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.hook)
            .env("IAC_ACTION", change.action.to_string())
            .env("IAC_RESOURCE_ID", &change.resource_id)
            .env("IAC_RESOURCE_KIND", &change.resource_kind)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::failed(resource, format!("failed to run hook: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores stdin may exit before reading it.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("Hook did not read the change payload: {e}");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::failed(resource, format!("failed to wait for hook: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let excerpt: String = stderr.chars().take(MAX_STDERR_CHARS).collect();
        let status = output
            .status
            .code()
            .map_or_else(|| String::from("terminated by signal"), |code| format!("exit status {code}"));

        Err(ProviderError::failed(
            resource,
            if excerpt.is_empty() {
                format!("hook failed with {status}")
            } else {
                format!("hook failed with {status}: {excerpt}")
            },
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::planner::ChangeAction;

    fn change(action: ChangeAction) -> PlannedChange {
        PlannedChange {
            resource_id: String::from("web"),
            resource_kind: String::from("vm"),
            action,
            depends_on: vec![],
            before: None,
            after: Some(serde_json::json!({"size": "small"})),
            reason: String::new(),
        }
    }

    #[tokio::test]
    async fn test_zero_exit_succeeds() {
        let provider = CommandProvider::new("true");
        assert!(provider.apply_change(&change(ChangeAction::Create)).await.is_ok());
    }

    #[tokio::test]
    async fn test_environment_is_set() {
        let provider = CommandProvider::new(
            r#"[ "$IAC_ACTION" = "update" ] && [ "$IAC_RESOURCE_ID" = "web" ] && [ "$IAC_RESOURCE_KIND" = "vm" ]"#,
        );
        assert!(provider.apply_change(&change(ChangeAction::Update)).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_on_stdin() {
        let provider = CommandProvider::new(r#"grep -q '"resource_id":"web"'"#);
        assert!(provider.apply_change(&change(ChangeAction::Create)).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let provider = CommandProvider::new("echo 'quota exceeded' >&2; exit 3");
        let err = provider
            .apply_change(&change(ChangeAction::Create))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("web: "));
        assert!(message.contains("exit status 3"));
        assert!(message.contains("quota exceeded"));
    }
}
