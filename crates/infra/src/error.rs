use contentforge_ai::GenerationError;
use contentforge_auth::AuthzError;
use contentforge_core::{DomainError, JobId, VersionId};
use contentforge_jobs::VersionError;
use contentforge_ledger::LedgerError;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors surfaced by the pipeline's public operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("insufficient token balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: String },

    #[error("job {job_id} cannot be retried while {status}")]
    NotRetryable { job_id: JobId, status: String },

    #[error("cannot compare version {0} with itself")]
    SameVersion(VersionId),

    #[error("versions {left} and {right} belong to different jobs")]
    CrossJob { left: VersionId, right: VersionId },

    #[error("version {0} is active and cannot be deleted")]
    CannotDeleteActiveVersion(VersionId),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    /// A state machine refused a transition the pipeline attempted.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn job_not_found(job_id: JobId) -> Self {
        Self::NotFound(format!("job {job_id}"))
    }

    pub fn version_not_found(version_id: VersionId) -> Self {
        Self::NotFound(format!("version {version_id}"))
    }
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { requested, available } => {
                Self::InsufficientBalance { requested, available }
            }
            other => Self::Ledger(other),
        }
    }
}

impl From<VersionError> for PipelineError {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::NotFound(id) => Self::version_not_found(id),
            VersionError::SameVersion(id) => Self::SameVersion(id),
            VersionError::CrossJob { left, right } => Self::CrossJob { left, right },
            VersionError::CannotDeleteActive(id) => Self::CannotDeleteActiveVersion(id),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => Self::job_not_found(id),
            StoreError::VersionNotFound(id) => Self::version_not_found(id),
            StoreError::TenantIsolation => Self::Forbidden("resource belongs to another agency".to_string()),
            StoreError::Version(e) => e.into(),
            other => Self::Store(other),
        }
    }
}

impl From<AuthzError> for PipelineError {
    fn from(err: AuthzError) -> Self {
        Self::Forbidden(err.to_string())
    }
}

impl From<DomainError> for PipelineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}
