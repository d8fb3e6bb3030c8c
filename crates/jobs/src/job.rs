use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use contentforge_core::{
    AgencyId, AggregateRoot, CampaignId, ClientId, DomainError, DomainResult, JobId, ReservationId, StepKind,
    UserId,
};

use crate::request::JobRequest;
use crate::step::{Step, StepStatus};

/// Lifecycle of a generation job.
///
/// ```text
/// PENDING → IN_PROGRESS → { COMPLETED | FAILED | CANCELLED }
///                              FAILED → PENDING (retry only)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed {
        step: StepKind,
        reason: String,
        tokens_refunded: u64,
    },
    Cancelled {
        reason: Option<String>,
    },
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed { .. } => "FAILED",
            JobStatus::Cancelled { .. } => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobStatus::Cancelled { .. })
    }

    /// `Failed → Pending` is the retry path; every other terminal state is final.
    pub fn can_transition_to(&self, next: &JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled { .. })
                | (InProgress, Completed)
                | (InProgress, Failed { .. })
                | (InProgress, Cancelled { .. })
                | (Failed { .. }, Pending)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generation job with its embedded steps.
///
/// Steps live inside the job record so that a single read always returns a
/// consistent job + steps snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub agency_id: AgencyId,
    pub client_id: ClientId,
    pub campaign_id: Option<CampaignId>,
    pub status: JobStatus,
    pub steps: Vec<Step>,
    pub prompt: String,
    pub parameters: JsonValue,
    /// Reservation backing the current run.
    pub reservation_id: Option<ReservationId>,
    /// Cumulative tokens reserved across runs, overrun extensions and regenerations.
    pub reserved_tokens: u64,
    pub consumed_tokens: u64,
    pub refunded_tokens: u64,
    /// Starts at 1; bumped by every retry.
    pub run: u32,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Store revision, bumped on every successful update.
    pub revision: u64,
}

impl AggregateRoot for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.revision
    }
}

impl Job {
    /// Builds a PENDING job whose steps carry their estimated share.
    ///
    /// The request is assumed to be validated already.
    pub fn new(
        id: JobId,
        agency_id: AgencyId,
        created_by: UserId,
        request: &JobRequest,
        estimate: impl Fn(StepKind) -> u64,
        now: DateTime<Utc>,
    ) -> Self {
        let steps: Vec<Step> = request
            .steps
            .iter()
            .map(|kind| Step::new(id, *kind, estimate(*kind)))
            .collect();
        let reserved_tokens = steps.iter().map(|s| s.reserved_tokens).sum();

        Self {
            id,
            agency_id,
            client_id: request.client_id,
            campaign_id: request.campaign_id,
            status: JobStatus::Pending,
            steps,
            prompt: request.prompt.clone(),
            parameters: request.parameters.clone(),
            reservation_id: None,
            reserved_tokens,
            consumed_tokens: 0,
            refunded_tokens: 0,
            run: 1,
            created_by,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn attach_reservation(&mut self, reservation_id: ReservationId) {
        self.reservation_id = Some(reservation_id);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, kind: StepKind) -> Option<&Step> {
        self.steps.iter().find(|s| s.kind == kind)
    }

    fn step_mut(&mut self, kind: StepKind) -> DomainResult<&mut Step> {
        self.steps
            .iter_mut()
            .find(|s| s.kind == kind)
            .ok_or_else(|| DomainError::validation(format!("job has no {kind} step")))
    }

    /// First step that has not completed (or been skipped) yet.
    pub fn next_step(&self) -> Option<StepKind> {
        self.steps
            .iter()
            .find(|s| !s.status.clears_successors())
            .map(|s| s.kind)
    }

    pub fn in_flight_step(&self) -> Option<StepKind> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
            .map(|s| s.kind)
    }

    /// Steps before `kind` whose outputs feed into it.
    pub fn predecessors(&self, kind: StepKind) -> impl Iterator<Item = &Step> {
        self.steps.iter().take_while(move |s| s.kind != kind)
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(&next) {
            return Err(DomainError::illegal_transition(&self.status, &next));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::InProgress, now)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Marks `kind` IN_PROGRESS for another attempt and returns the attempt number.
    pub fn begin_step(&mut self, kind: StepKind, now: DateTime<Utc>) -> DomainResult<u32> {
        if self.status != JobStatus::InProgress {
            return Err(DomainError::invariant(format!(
                "cannot run {kind} while job is {}",
                self.status
            )));
        }
        if let Some(blocker) = self.predecessors(kind).find(|s| !s.status.clears_successors()) {
            return Err(DomainError::invariant(format!(
                "{kind} cannot start before {} finishes",
                blocker.kind
            )));
        }
        let attempt = self.step_mut(kind)?.begin_attempt(now)?;
        self.updated_at = now;
        Ok(attempt)
    }

    /// Records a successful step; `tokens` must already be covered by the reservation.
    pub fn complete_step(&mut self, kind: StepKind, tokens: u64, now: DateTime<Utc>) -> DomainResult<()> {
        if self.consumed_tokens + tokens > self.reserved_tokens {
            return Err(DomainError::invariant(format!(
                "consumed tokens would exceed reserved ({} + {tokens} > {})",
                self.consumed_tokens, self.reserved_tokens
            )));
        }
        self.step_mut(kind)?.complete(tokens, now)?;
        self.consumed_tokens += tokens;
        self.updated_at = now;
        Ok(())
    }

    /// Books tokens already committed for an in-flight step that will not complete.
    pub fn charge_step(&mut self, kind: StepKind, tokens: u64, now: DateTime<Utc>) -> DomainResult<()> {
        if self.consumed_tokens + tokens > self.reserved_tokens {
            return Err(DomainError::invariant(format!(
                "consumed tokens would exceed reserved ({} + {tokens} > {})",
                self.consumed_tokens, self.reserved_tokens
            )));
        }
        let step = self.step_mut(kind)?;
        if step.status != StepStatus::InProgress {
            return Err(DomainError::invariant(format!("{kind} is {} and cannot be charged", step.status)));
        }
        step.tokens_used += tokens;
        self.consumed_tokens += tokens;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail_step(&mut self, kind: StepKind, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.step_mut(kind)?.fail(reason.into(), now)?;
        self.updated_at = now;
        Ok(())
    }

    /// Notes a transient failure on a step that stays IN_PROGRESS for another attempt.
    pub fn record_step_error(&mut self, kind: StepKind, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.step_mut(kind)?.last_error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// Grows the reservation after a commit overran the step estimate.
    pub fn record_extension(&mut self, tokens: u64) {
        self.reserved_tokens += tokens;
    }

    pub fn record_refund(&mut self, tokens: u64) {
        self.refunded_tokens += tokens;
    }

    /// Accounts for a manual regeneration of an already completed step.
    pub fn record_regeneration(&mut self, kind: StepKind, reserved: u64, consumed: u64, refunded: u64, now: DateTime<Utc>) -> DomainResult<()> {
        let step = self.step_mut(kind)?;
        if step.status != StepStatus::Completed {
            return Err(DomainError::invariant(format!("{kind} has not completed")));
        }
        step.tokens_used += consumed;
        self.reserved_tokens += reserved;
        self.consumed_tokens += consumed;
        self.refunded_tokens += refunded;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(kind) = self.next_step() {
            return Err(DomainError::invariant(format!("{kind} has not finished")));
        }
        self.transition(JobStatus::Completed, now)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        step: StepKind,
        reason: impl Into<String>,
        tokens_refunded: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.transition(
            JobStatus::Failed {
                step,
                reason: reason.into(),
                tokens_refunded,
            },
            now,
        )?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Cancels the job; an in-flight step becomes SKIPPED and is returned.
    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> DomainResult<Option<StepKind>> {
        self.transition(JobStatus::Cancelled { reason }, now)?;
        let skipped = self.in_flight_step();
        if let Some(kind) = skipped {
            self.step_mut(kind)?.skip()?;
        }
        self.completed_at = Some(now);
        Ok(skipped)
    }

    /// Tokens a retry has to reserve: the estimate of every unfinished step.
    pub fn retry_estimate(&self, estimate: impl Fn(StepKind) -> u64) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Completed)
            .map(|s| estimate(s.kind))
            .sum()
    }

    /// FAILED → PENDING under a fresh reservation. Completed steps are untouched.
    pub fn resume(
        &mut self,
        reservation_id: ReservationId,
        estimate: impl Fn(StepKind) -> u64,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.status.is_failed() {
            return Err(DomainError::illegal_transition(&self.status, JobStatus::Pending));
        }
        let mut reserved = 0;
        for step in self.steps.iter_mut().filter(|s| s.status != StepStatus::Completed) {
            let share = estimate(step.kind);
            step.reset_for_retry(share)?;
            reserved += share;
        }
        self.transition(JobStatus::Pending, now)?;
        self.reservation_id = Some(reservation_id);
        self.reserved_tokens += reserved;
        self.run += 1;
        self.completed_at = None;
        Ok(())
    }

    pub fn total_tokens_used(&self) -> u64 {
        self.steps.iter().map(|s| s.tokens_used).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(kind: StepKind) -> u64 {
        match kind {
            StepKind::IdeaGeneration => 10,
            StepKind::CopyDesign => 20,
            StepKind::BaseImage => 15,
            StepKind::FinalDesign => 5,
        }
    }

    fn job() -> Job {
        let request = JobRequest::full_pipeline(ClientId::new(), "autumn launch");
        let mut job = Job::new(JobId::new(), AgencyId::new(), UserId::new(), &request, estimate, Utc::now());
        job.attach_reservation(ReservationId::new());
        job
    }

    #[test]
    fn new_job_reserves_sum_of_estimates() {
        let job = job();
        assert_eq!(job.reserved_tokens, 50);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(job.next_step(), Some(StepKind::IdeaGeneration));
    }

    #[test]
    fn steps_run_in_order() {
        let mut job = job();
        let now = Utc::now();
        job.start(now).unwrap();
        assert!(job.begin_step(StepKind::CopyDesign, now).is_err());

        job.begin_step(StepKind::IdeaGeneration, now).unwrap();
        job.complete_step(StepKind::IdeaGeneration, 10, now).unwrap();
        assert_eq!(job.next_step(), Some(StepKind::CopyDesign));
        assert_eq!(job.consumed_tokens, 10);
    }

    #[test]
    fn consumption_beyond_reservation_is_rejected() {
        let mut job = job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.begin_step(StepKind::IdeaGeneration, now).unwrap();
        assert!(job.complete_step(StepKind::IdeaGeneration, 51, now).is_err());

        job.record_extension(1);
        job.complete_step(StepKind::IdeaGeneration, 51, now).unwrap();
        assert_eq!(job.consumed_tokens, job.reserved_tokens);
    }

    #[test]
    fn cannot_complete_with_unfinished_steps() {
        let mut job = job();
        job.start(Utc::now()).unwrap();
        assert!(job.complete(Utc::now()).is_err());
    }

    #[test]
    fn cancel_skips_in_flight_step() {
        let mut job = job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.begin_step(StepKind::IdeaGeneration, now).unwrap();
        job.complete_step(StepKind::IdeaGeneration, 10, now).unwrap();
        job.begin_step(StepKind::CopyDesign, now).unwrap();

        let skipped = job.cancel(Some("client changed brief".into()), now).unwrap();
        assert_eq!(skipped, Some(StepKind::CopyDesign));
        assert_eq!(job.step(StepKind::CopyDesign).unwrap().status, StepStatus::Skipped);
        assert_eq!(job.step(StepKind::BaseImage).unwrap().status, StepStatus::Pending);
        assert!(job.status.is_cancelled());
    }

    #[test]
    fn terminal_jobs_reject_cancel() {
        let mut job = job();
        job.cancel(None, Utc::now()).unwrap();
        assert!(matches!(
            job.cancel(None, Utc::now()),
            Err(DomainError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn resume_resets_only_unfinished_steps() {
        let mut job = job();
        let now = Utc::now();
        job.start(now).unwrap();
        for kind in [StepKind::IdeaGeneration, StepKind::CopyDesign] {
            job.begin_step(kind, now).unwrap();
            job.complete_step(kind, estimate(kind), now).unwrap();
        }
        job.begin_step(StepKind::BaseImage, now).unwrap();
        job.fail_step(StepKind::BaseImage, "timeout", now).unwrap();
        job.fail(StepKind::BaseImage, "timeout", 20, now).unwrap();

        assert_eq!(job.retry_estimate(estimate), 20);
        job.resume(ReservationId::new(), estimate, now).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run, 2);
        assert_eq!(job.reserved_tokens, 70);
        assert_eq!(job.step(StepKind::CopyDesign).unwrap().status, StepStatus::Completed);
        let base = job.step(StepKind::BaseImage).unwrap();
        assert_eq!(base.status, StepStatus::Pending);
        assert_eq!(base.attempts, 0);
        assert_eq!(job.next_step(), Some(StepKind::BaseImage));
    }

    #[test]
    fn only_failed_jobs_resume() {
        let mut job = job();
        assert!(job.resume(ReservationId::new(), estimate, Utc::now()).is_err());
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = JobStatus::Failed {
            step: StepKind::BaseImage,
            reason: "timeout".into(),
            tokens_refunded: 20,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "FAILED");
        assert_eq!(json["step"], "BASE_IMAGE");
    }
}
