//! Persistence for plan artifacts and applied state.
//!
//! Everything is stored through a [`StorageBackend`]: a local directory for
//! single-machine use, or an S3 bucket when plans are generated and applied
//! on different machines.

mod backend;
mod local;
mod lock;
mod plans;
mod s3;
mod state;
mod types;

pub use backend::StorageBackend;
pub use local::LocalBackend;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use plans::PlanStore;
pub use s3::S3Backend;
pub use state::StateStore;
pub use types::{ApplyHistoryEntry, InfraState, ResourceRecord, STATE_VERSION};

#[cfg(test)]
pub use backend::MockStorageBackend;
