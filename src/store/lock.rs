//! The apply lock.
//!
//! The lock is an ordinary object created with the backend's no-overwrite
//! primitive, so two machines racing for it cannot both win. A lock left
//! behind by a crashed run stops blocking others once it expires.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds before an abandoned lock may be taken over.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// Contents of the lock object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Process that holds the lock.
    pub holder: String,
    /// Plan being applied under this lock.
    #[serde(default)]
    pub plan: Option<String>,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lock may be taken over.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Describes a fresh lock taken now by `holder`.
    #[must_use]
    pub fn new(holder: &str, plan: Option<&str>) -> Self {
        Self::taken_at(holder, plan, Utc::now())
    }

    /// Describes a lock taken at `at`.
    #[must_use]
    pub fn taken_at(holder: &str, plan: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            plan: plan.map(ToString::to_string),
            acquired_at: at,
            expires_at: at + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Whether the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the lock had expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Seconds left before the lock expires, never negative.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    /// The same lock with its expiry pushed one full period past now.
    #[must_use]
    pub fn renewed(&self) -> Self {
        Self {
            expires_at: Utc::now() + Duration::seconds(LOCK_EXPIRY_SECS),
            ..self.clone()
        }
    }

    /// Holder and plan, as shown to a process that finds the lock taken.
    #[must_use]
    pub fn owner(&self) -> String {
        match &self.plan {
            Some(plan) => format!("{} applying {plan}", self.holder),
            None => self.holder.clone(),
        }
    }
}

/// Identifies the current process as `<hostname>-<pid>-<random>`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().into_owned());
    let nonce = Uuid::new_v4().simple().to_string();

    format!("{host}-{}-{}", std::process::id(), &nonce[..8])
}
