//! Applied-state store.
//!
//! Holds the record of what has been applied and the lock that serializes
//! apply runs. Both live next to the plans in the same backend.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{IacError, Result, StoreError};

use super::backend::StorageBackend;
use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::types::InfraState;

/// State object key.
const STATE_KEY: &str = "state.json";

/// Lock object key.
const LOCK_KEY: &str = "state.lock";

/// Attempts made to take the lock before giving up.
const LOCK_ATTEMPTS: usize = 2;

/// Store for the applied state and its lock.
#[derive(Debug, Clone)]
pub struct StateStore {
    /// Underlying blob storage.
    backend: Arc<dyn StorageBackend>,
}

impl StateStore {
    /// Creates a state store over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Loads the applied state.
    ///
    /// Returns an empty state if nothing has been applied yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or parsed.
    pub async fn load(&self) -> Result<InfraState> {
        let Some(content) = self.backend.get(STATE_KEY).await? else {
            debug!("No applied state in {}, starting empty", self.backend.location());
            return Ok(InfraState::new());
        };

        let state: InfraState = serde_json::from_slice(&content)
            .map_err(|e| StoreError::corrupted(STATE_KEY, format!("Failed to parse state: {e}")))?;

        debug!(
            "Loaded state serial {} with {} resources",
            state.serial,
            state.resources.len()
        );
        Ok(state)
    }

    /// Saves the applied state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized or written.
    pub async fn save(&self, state: &InfraState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::serialization(format!("Failed to serialize state: {e}")))?;

        self.backend.replace(STATE_KEY, &content).await?;

        debug!("State saved at serial {}", state.serial);
        Ok(())
    }

    /// Acquires the state lock for an apply run.
    ///
    /// An expired lock is taken over.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockedByOther`] if another process holds a live lock.
    pub async fn acquire_lock(&self, plan: Option<&str>) -> Result<LockInfo> {
        let holder = generate_holder_id();

        for _ in 0..LOCK_ATTEMPTS {
            let lock_info = LockInfo::new(&holder, plan);
            let content = serde_json::to_vec_pretty(&lock_info)
                .map_err(|e| StoreError::serialization(format!("Failed to serialize lock: {e}")))?;

            match self.backend.create(LOCK_KEY, &content).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock: {} (expires in {}s)",
                        lock_info.lock_id, LOCK_EXPIRY_SECS
                    );
                    return Ok(lock_info);
                }
                Err(IacError::Store(StoreError::AlreadyExists { .. })) => {
                    match self.get_lock_info().await? {
                        Some(existing) if !existing.is_expired() => {
                            return Err(StoreError::LockedByOther {
                                holder: existing.owner(),
                                since: existing.acquired_at.to_rfc3339(),
                            }
                            .into());
                        }
                        Some(existing) => {
                            warn!("Expired lock held by {} found, taking over", existing.holder);
                            self.take_over(&existing).await?;
                        }
                        None => debug!("Lock released while acquiring, retrying"),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::LockFailed {
            message: String::from("lock is contended, try again"),
        }
        .into())
    }

    /// Removes an expired lock so it can be acquired again.
    ///
    /// A claim object keyed by the expired lock's id admits one process at a
    /// time, and the lock is re-read under the claim so a lock that another
    /// process already replaced is never deleted.
    async fn take_over(&self, expired: &LockInfo) -> Result<()> {
        let claim = format!("{LOCK_KEY}.takeover-{}", expired.lock_id);

        match self.backend.create(&claim, expired.holder.as_bytes()).await {
            Ok(()) => {}
            Err(IacError::Store(StoreError::AlreadyExists { .. })) => {
                return Err(StoreError::LockFailed {
                    message: format!(
                        "another process is taking over the expired lock of {}",
                        expired.holder
                    ),
                }
                .into());
            }
            Err(e) => return Err(e),
        }

        let outcome = match self.get_lock_info().await {
            Ok(Some(current)) if current.lock_id == expired.lock_id && current.is_expired() => {
                self.backend.delete(LOCK_KEY).await
            }
            Ok(Some(current)) if !current.is_expired() => Err(StoreError::LockedByOther {
                holder: current.owner(),
                since: current.acquired_at.to_rfc3339(),
            }
            .into()),
            Ok(Some(current)) => Err(StoreError::LockFailed {
                message: format!("expired lock was replaced by {}", current.owner()),
            }
            .into()),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = self.backend.delete(&claim).await {
            warn!("Failed to remove takeover claim {claim}: {e}");
        }
        outcome
    }

    /// Pushes back the expiry of a lock this process holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockFailed`] if the lock was removed or now
    /// belongs to someone else.
    pub async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.get_lock_info().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                let renewed = lock.renewed();
                let content = serde_json::to_vec_pretty(&renewed)
                    .map_err(|e| StoreError::serialization(format!("Failed to serialize lock: {e}")))?;
                self.backend.replace(LOCK_KEY, &content).await?;
                debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
                Ok(renewed)
            }
            Some(existing) => Err(StoreError::LockFailed {
                message: format!("lock {} was taken over by {}", lock.lock_id, existing.owner()),
            }
            .into()),
            None => Err(StoreError::LockFailed {
                message: format!("lock {} was removed", lock.lock_id),
            }
            .into()),
        }
    }

    /// Releases a lock previously returned by [`Self::acquire_lock`].
    ///
    /// A lock that has since been taken over by someone else is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be read or deleted.
    pub async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        match self.get_lock_info().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                self.backend.delete(LOCK_KEY).await?;
                info!("Released state lock: {}", lock.lock_id);
            }
            Some(existing) => {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    lock.lock_id, existing.lock_id
                );
            }
            None => debug!("Lock {} already gone", lock.lock_id),
        }
        Ok(())
    }

    /// Gets current lock information if locked.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock object cannot be read or parsed.
    pub async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.backend.get(LOCK_KEY).await? else {
            return Ok(None);
        };

        let lock_info = serde_json::from_slice(&content)
            .map_err(|e| StoreError::corrupted(LOCK_KEY, format!("Failed to parse lock: {e}")))?;
        Ok(Some(lock_info))
    }

    /// Checks if the state is locked by a live lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock object cannot be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ChangeAction, PlannedChange};
    use crate::store::LocalBackend;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn create_test_store() -> (StateStore, Arc<LocalBackend>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = Arc::new(LocalBackend::new(temp_dir.path()));
        let store = StateStore::new(backend.clone());
        (store, backend, temp_dir)
    }

    #[tokio::test]
    async fn test_load_empty() {
        let (store, _backend, _temp) = create_test_store();

        let state = store.load().await.unwrap();
        assert_eq!(state.serial, 0);
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _backend, _temp) = create_test_store();

        let mut state = InfraState::new();
        state.record(
            &PlannedChange {
                resource_id: String::from("web"),
                resource_kind: String::from("vm"),
                action: ChangeAction::Create,
                depends_on: vec![],
                before: None,
                after: Some(serde_json::json!({"size": "small"})),
                reason: String::new(),
            },
            "web_2024-01-01T00:00:00Z.plan.sw.json",
        );
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, backend, _temp) = create_test_store();
        backend.replace(STATE_KEY, b"not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, IacError::Store(StoreError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _backend, _temp) = create_test_store();

        let lock = store.acquire_lock(Some("plan")).await.unwrap();
        assert!(store.is_locked().await.unwrap());

        store.release_lock(&lock).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _backend, _temp) = create_test_store();

        let _lock = store.acquire_lock(None).await.unwrap();

        let err = store.acquire_lock(None).await.unwrap_err();
        assert!(matches!(err, IacError::Store(StoreError::LockedByOther { .. })));
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (store, backend, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed-host", None);
        stale.expires_at = stale.acquired_at - chrono::Duration::seconds(1);
        backend
            .create(LOCK_KEY, &serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let lock = store.acquire_lock(None).await.unwrap();
        assert_ne!(lock.lock_id, stale.lock_id);
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, lock.lock_id);
    }

    #[tokio::test]
    async fn test_takeover_leaves_no_claim_behind() {
        let (store, backend, _temp) = create_test_store();

        let stale = LockInfo::taken_at("crashed-host", None, Utc::now() - Duration::hours(2));
        backend
            .create(LOCK_KEY, &serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let lock = store.acquire_lock(None).await.unwrap();
        assert_eq!(backend.list("").await.unwrap(), vec![LOCK_KEY.to_string()]);
        store.release_lock(&lock).await.unwrap();
        assert!(backend.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_takeover_loses_cleanly() {
        let (store, backend, _temp) = create_test_store();

        let stale = LockInfo::taken_at("crashed-host", None, Utc::now() - Duration::hours(2));
        backend
            .create(LOCK_KEY, &serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();
        // Another process is midway through taking over the same stale lock.
        let claim = format!("{LOCK_KEY}.takeover-{}", stale.lock_id);
        backend.create(&claim, b"other-host").await.unwrap();

        let err = store.acquire_lock(None).await.unwrap_err();
        assert!(matches!(err, IacError::Store(StoreError::LockFailed { .. })));
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, stale.lock_id);
        assert!(backend.exists(&claim).await.unwrap());
    }

    #[tokio::test]
    async fn test_renewal_extends_held_lock() {
        let (store, backend, _temp) = create_test_store();

        let nearly_expired =
            LockInfo::taken_at("this-host", Some("plan"), Utc::now() - Duration::seconds(LOCK_EXPIRY_SECS - 5));
        backend
            .create(LOCK_KEY, &serde_json::to_vec(&nearly_expired).unwrap())
            .await
            .unwrap();

        let renewed = store.renew_lock(&nearly_expired).await.unwrap();
        assert_eq!(renewed.lock_id, nearly_expired.lock_id);
        assert!(renewed.expires_at > nearly_expired.expires_at);

        let stored = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(stored, renewed);

        // A live renewed lock cannot be taken over.
        let err = store.acquire_lock(None).await.unwrap_err();
        assert!(matches!(err, IacError::Store(StoreError::LockedByOther { .. })));
    }

    #[tokio::test]
    async fn test_renewal_fails_once_lock_is_replaced() {
        let (store, backend, _temp) = create_test_store();

        let held = store.acquire_lock(Some("plan")).await.unwrap();
        let foreign = LockInfo::new("other-host", None);
        backend
            .replace(LOCK_KEY, &serde_json::to_vec(&foreign).unwrap())
            .await
            .unwrap();

        let err = store.renew_lock(&held).await.unwrap_err();
        assert!(matches!(err, IacError::Store(StoreError::LockFailed { .. })));
        assert_eq!(store.get_lock_info().await.unwrap().unwrap(), foreign);

        backend.delete(LOCK_KEY).await.unwrap();
        let err = store.renew_lock(&held).await.unwrap_err();
        assert!(matches!(err, IacError::Store(StoreError::LockFailed { .. })));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_foreign_lock_is_noop() {
        let (store, _backend, _temp) = create_test_store();

        let held = store.acquire_lock(None).await.unwrap();
        let other = LockInfo::new("someone-else", None);

        store.release_lock(&other).await.unwrap();
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, held.lock_id);
    }
}
