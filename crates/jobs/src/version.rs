use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use contentforge_core::{AgencyId, JobId, StepKind, UserId, VersionId};

/// Who produced or changed a version.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Actor {
    Pipeline,
    User(UserId),
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Actor::Pipeline => f.write_str("pipeline"),
            Actor::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Identity of one pipeline attempt at one step.
///
/// Used as the ledger commit key and to deduplicate pipeline versions, so a
/// replayed result never charges or stores twice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub job_id: JobId,
    pub step: StepKind,
    pub run: u32,
    pub attempt: u32,
}

impl core::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}:r{}:a{}", self.job_id, self.step, self.run, self.attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersionOrigin {
    Generated { key: ExecutionKey },
    Regenerated { requested_by: UserId },
    Manual { edited_by: UserId },
}

impl VersionOrigin {
    pub fn execution_key(&self) -> Option<&ExecutionKey> {
        match self {
            VersionOrigin::Generated { key } => Some(key),
            _ => None,
        }
    }
}

/// Immutable output of one step execution.
///
/// Only `is_active` and `activated_at` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVersion {
    pub id: VersionId,
    pub job_id: JobId,
    pub agency_id: AgencyId,
    pub step: StepKind,
    /// 1-based, monotonic per (job, step), never reused.
    pub number: u32,
    pub content: JsonValue,
    pub token_cost: u64,
    pub created_by: Actor,
    pub origin: VersionOrigin,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl ContentVersion {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            step: self.step,
            number: self.number,
            token_cost: self.token_cost,
            is_active: self.is_active,
            created_by: self.created_by,
            created_at: self.created_at,
        }
    }
}

/// Input for creating a version; the store assigns id and number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    pub job_id: JobId,
    pub agency_id: AgencyId,
    pub step: StepKind,
    pub content: JsonValue,
    pub token_cost: u64,
    pub created_by: Actor,
    pub origin: VersionOrigin,
}

impl NewVersion {
    pub fn generated(
        agency_id: AgencyId,
        key: ExecutionKey,
        content: JsonValue,
        token_cost: u64,
    ) -> Self {
        Self {
            job_id: key.job_id,
            agency_id,
            step: key.step,
            content,
            token_cost,
            created_by: Actor::Pipeline,
            origin: VersionOrigin::Generated { key },
        }
    }

    pub fn into_version(self, id: VersionId, number: u32, now: DateTime<Utc>) -> ContentVersion {
        ContentVersion {
            id,
            job_id: self.job_id,
            agency_id: self.agency_id,
            step: self.step,
            number,
            content: self.content,
            token_cost: self.token_cost,
            created_by: self.created_by,
            origin: self.origin,
            is_active: false,
            created_at: now,
            activated_at: None,
        }
    }
}

/// Listing row without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub step: StepKind,
    pub number: u32,
    pub token_cost: u64,
    pub is_active: bool,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("version not found: {0}")]
    NotFound(VersionId),

    #[error("cannot compare version {0} with itself")]
    SameVersion(VersionId),

    #[error("versions {left} and {right} belong to different jobs")]
    CrossJob { left: VersionId, right: VersionId },

    #[error("version {0} is active and cannot be deleted")]
    CannotDeleteActive(VersionId),
}
