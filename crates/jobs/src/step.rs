use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use contentforge_core::{DomainError, DomainResult, JobId, StepKind};

/// Execution status of a single step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    /// Running, or waiting between transient retries.
    InProgress,
    Completed,
    Failed,
    /// Abandoned because the job was cancelled while it ran.
    Skipped,
}

impl StepStatus {
    /// Valid moves:
    /// - Pending → InProgress
    /// - InProgress → InProgress (next attempt), Completed, Failed, Skipped
    /// - Failed → Pending (job retry)
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, Pending)
        )
    }

    /// Whether later steps may start.
    pub fn clears_successors(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl core::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work inside a job.
///
/// The active output of a step is not stored here; it is looked up by
/// `(job_id, kind)` in the version store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub job_id: JobId,
    pub kind: StepKind,
    pub status: StepStatus,
    /// Share of the job reservation estimated for this step.
    pub reserved_tokens: u64,
    pub tokens_used: u64,
    /// Attempts made in the current run.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Step {
    pub fn new(job_id: JobId, kind: StepKind, reserved_tokens: u64) -> Self {
        Self {
            job_id,
            kind,
            status: StepStatus::Pending,
            reserved_tokens,
            tokens_used: 0,
            attempts: 0,
            started_at: None,
            executed_at: None,
            last_error: None,
        }
    }

    fn transition(&mut self, next: StepStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(
                format!("{} {}", self.kind, self.status),
                next,
            ));
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<u32> {
        self.transition(StepStatus::InProgress)?;
        self.attempts += 1;
        self.started_at.get_or_insert(now);
        Ok(self.attempts)
    }

    pub(crate) fn complete(&mut self, tokens: u64, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(StepStatus::Completed)?;
        self.tokens_used += tokens;
        self.executed_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    pub(crate) fn fail(&mut self, reason: String, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(StepStatus::Failed)?;
        self.executed_at = Some(now);
        self.last_error = Some(reason);
        Ok(())
    }

    pub(crate) fn skip(&mut self) -> DomainResult<()> {
        self.transition(StepStatus::Skipped)
    }

    pub(crate) fn reset_for_retry(&mut self, reserved_tokens: u64) -> DomainResult<()> {
        if self.status != StepStatus::Pending {
            self.transition(StepStatus::Pending)?;
        }
        self.reserved_tokens = reserved_tokens;
        self.attempts = 0;
        self.started_at = None;
        self.executed_at = None;
        Ok(())
    }

    /// Reserved share not yet turned into consumption.
    pub fn unused_share(&self) -> u64 {
        self.reserved_tokens.saturating_sub(self.tokens_used)
    }
}
