//! Persistence for job records and content versions.
//!
//! Both stores are synchronous traits with in-memory implementations. Writes
//! are visible to the next read (read-your-writes); a job record and its
//! embedded steps are always read and written as one unit.

pub mod job_store;
pub mod version_store;

pub use job_store::{InMemoryJobStore, JobStats, JobStore};
pub use version_store::{InMemoryVersionStore, VersionStore};

use contentforge_core::{JobId, VersionId};
use contentforge_jobs::VersionError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("version not found: {0}")]
    VersionNotFound(VersionId),

    #[error("tenant isolation violation")]
    TenantIsolation,

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub(crate) fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}
