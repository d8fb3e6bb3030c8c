use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use contentforge_ai::{ContentGenerator, GeneratedContent, GenerationContext, GenerationError, PriorOutput};
use contentforge_core::{AgencyId, JobId, ReservationId, StepKind, VersionId};
use contentforge_jobs::{ContentVersion, ExecutionKey, Job, JobStatus, NewVersion, Step, StepStatus};
use contentforge_ledger::{CommitReceipt, LedgerError};

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::TokenLedger;
use crate::pipeline::gates::JobGates;
use crate::store::{JobStore, VersionStore};

/// What happened to one attempt at a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        version_id: VersionId,
        token_cost: u64,
        extended_by: u64,
    },
    /// Transient failure; the step stays IN_PROGRESS.
    Retryable { attempt: u32, error: GenerationError },
    /// The step is FAILED and its unused share was refunded.
    Failed { reason: String, refunded: u64 },
    /// The job was cancelled; the result, if any, was discarded.
    Cancelled,
}

/// Runs single step attempts and records their results.
///
/// Never changes the job status; it reports outcomes and the orchestrator
/// decides what follows.
pub struct StepExecutor {
    jobs: Arc<dyn JobStore>,
    versions: Arc<dyn VersionStore>,
    ledger: Arc<dyn TokenLedger>,
    generator: Arc<dyn ContentGenerator>,
    gates: Arc<JobGates>,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        versions: Arc<dyn VersionStore>,
        ledger: Arc<dyn TokenLedger>,
        generator: Arc<dyn ContentGenerator>,
        gates: Arc<JobGates>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            versions,
            ledger,
            generator,
            gates,
            step_timeout,
        }
    }

    fn load(&self, agency_id: AgencyId, job_id: JobId) -> PipelineResult<Job> {
        self.jobs
            .get(agency_id, job_id)?
            .ok_or_else(|| PipelineError::job_not_found(job_id))
    }

    /// Active outputs of the completed steps before `step`, in order.
    pub(crate) fn prior_outputs(&self, job: &Job, step: StepKind) -> PipelineResult<Vec<PriorOutput>> {
        let mut outputs = Vec::new();
        for prior in job.predecessors(step).filter(|s| s.status == StepStatus::Completed) {
            if let Some(version) = self.versions.active_version(job.id, prior.kind)? {
                outputs.push(PriorOutput {
                    step: prior.kind,
                    version_id: version.id,
                    version_number: version.number,
                    content: version.content,
                });
            }
        }
        Ok(outputs)
    }

    pub(crate) fn context(&self, job: &Job, step: StepKind, attempt: u32) -> PipelineResult<GenerationContext> {
        Ok(GenerationContext {
            job_id: job.id,
            agency_id: job.agency_id,
            step,
            attempt,
            prompt: job.prompt.clone(),
            parameters: job.parameters.clone(),
            prior_outputs: self.prior_outputs(job, step)?,
        })
    }

    /// One attempt at `step`: generate, then commit, version and complete.
    pub async fn execute(
        &self,
        agency_id: AgencyId,
        job_id: JobId,
        step: StepKind,
        cancel: &CancellationToken,
    ) -> PipelineResult<StepOutcome> {
        let (context, key, reservation_id) = {
            let _gate = self.gates.lock(job_id).await;
            let mut job = self.load(agency_id, job_id)?;
            if job.status != JobStatus::InProgress {
                return Ok(StepOutcome::Cancelled);
            }
            let attempt = job.begin_step(step, Utc::now())?;
            self.jobs.update(&mut job)?;

            let reservation_id = job
                .reservation_id
                .ok_or_else(|| PipelineError::Internal(format!("job {job_id} has no reservation")))?;
            let key = ExecutionKey {
                job_id,
                step,
                run: job.run,
                attempt,
            };
            (self.context(&job, step, attempt)?, key, reservation_id)
        };

        debug!(job_id = %job_id, step = %step, attempt = key.attempt, run = key.run, "step attempt started");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job_id = %job_id, step = %step, "generation abandoned after cancellation");
                return Ok(StepOutcome::Cancelled);
            }
            result = tokio::time::timeout(self.step_timeout, self.generator.generate(&context)) => {
                result.unwrap_or(Err(GenerationError::Timeout(self.step_timeout)))
            }
        };

        let _gate = self.gates.lock(job_id).await;
        let mut job = self.load(agency_id, job_id)?;
        if job.status != JobStatus::InProgress {
            info!(job_id = %job_id, step = %step, status = %job.status, "discarding late step result");
            return Ok(StepOutcome::Cancelled);
        }

        match result {
            Ok(generated) => self.record_success(&mut job, step, key, reservation_id, generated),
            Err(error) if error.is_transient() => {
                job.record_step_error(step, error.to_string(), Utc::now())?;
                self.jobs.update(&mut job)?;
                warn!(job_id = %job_id, step = %step, attempt = key.attempt, error = %error, "transient step failure");
                Ok(StepOutcome::Retryable {
                    attempt: key.attempt,
                    error,
                })
            }
            Err(error) => self.fail_locked(&mut job, step, error.to_string()),
        }
    }

    /// Marks `step` FAILED and refunds its unused share.
    ///
    /// Used by the orchestrator once transient retries are exhausted.
    pub async fn fail_step(
        &self,
        agency_id: AgencyId,
        job_id: JobId,
        step: StepKind,
        reason: String,
    ) -> PipelineResult<StepOutcome> {
        let _gate = self.gates.lock(job_id).await;
        let mut job = self.load(agency_id, job_id)?;
        if job.status != JobStatus::InProgress {
            return Ok(StepOutcome::Cancelled);
        }
        self.fail_locked(&mut job, step, reason)
    }

    fn record_success(
        &self,
        job: &mut Job,
        step: StepKind,
        key: ExecutionKey,
        reservation_id: ReservationId,
        generated: GeneratedContent,
    ) -> PipelineResult<StepOutcome> {
        let receipt = match self.ledger.commit(reservation_id, generated.token_cost, &key.to_string()) {
            Ok(receipt) => receipt,
            Err(LedgerError::ExceedsReservation { excess, available, .. }) => {
                let reason = format!(
                    "generation cost {} exceeds the job budget by {excess} tokens ({available} available)",
                    generated.token_cost
                );
                return self.fail_locked(job, step, reason);
            }
            Err(e) => return Err(e.into()),
        };

        // The commit is already booked; anything failing past this point
        // still charges the step so the job counters match the ledger.
        let stored = self.store_output(job, step, key, &receipt, generated);
        let version = match stored {
            Ok(version) => version,
            Err(e) => return self.fail_charged(job.agency_id, job.id, step, &receipt, e),
        };

        info!(
            job_id = %job.id,
            step = %step,
            version = version.number,
            tokens = receipt.amount,
            extended_by = receipt.extended_by,
            "step completed"
        );
        Ok(StepOutcome::Completed {
            version_id: version.id,
            token_cost: receipt.amount,
            extended_by: receipt.extended_by,
        })
    }

    fn store_output(
        &self,
        job: &mut Job,
        step: StepKind,
        key: ExecutionKey,
        receipt: &CommitReceipt,
        generated: GeneratedContent,
    ) -> PipelineResult<ContentVersion> {
        let now = Utc::now();
        job.record_extension(receipt.extended_by);
        let created = self
            .versions
            .create(NewVersion::generated(job.agency_id, key, generated.content, receipt.amount), now)?;
        let version = self.versions.activate(created.id, now)?;
        job.complete_step(step, receipt.amount, now)?;
        self.jobs.update(job)?;
        Ok(version)
    }

    /// Fails a step whose tokens were committed but whose output was not stored.
    fn fail_charged(
        &self,
        agency_id: AgencyId,
        job_id: JobId,
        step: StepKind,
        receipt: &CommitReceipt,
        cause: PipelineError,
    ) -> PipelineResult<StepOutcome> {
        error!(job_id = %job_id, step = %step, tokens = receipt.amount, error = %cause, "step output not stored after commit");
        let mut job = self.load(agency_id, job_id)?;
        let now = Utc::now();
        job.record_extension(receipt.extended_by);
        job.charge_step(step, receipt.amount, now)?;
        self.fail_locked(&mut job, step, format!("could not store step output: {cause}"))
    }

    fn fail_locked(&self, job: &mut Job, step: StepKind, reason: String) -> PipelineResult<StepOutcome> {
        job.fail_step(step, reason.as_str(), Utc::now())?;
        let share = job.step(step).map(Step::unused_share).unwrap_or(0);
        let refunded = match job.reservation_id {
            Some(reservation_id) if share > 0 => self.ledger.refund(reservation_id, share)?,
            _ => 0,
        };
        job.record_refund(refunded);
        self.jobs.update(job)?;

        warn!(job_id = %job.id, step = %step, refunded, reason = %reason, "step failed");
        Ok(StepOutcome::Failed { reason, refunded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contentforge_ai::{ScriptedGenerator, ScriptedOutcome};
    use contentforge_core::{ClientId, UserId};
    use contentforge_jobs::JobRequest;

    use std::collections::BTreeMap;

    use crate::ledger::InMemoryTokenLedger;
    use crate::store::{InMemoryJobStore, InMemoryVersionStore, StoreError};

    /// Version store that rejects every write.
    struct ReadOnlyVersions;

    impl VersionStore for ReadOnlyVersions {
        fn create(&self, _new: NewVersion, _now: chrono::DateTime<Utc>) -> Result<ContentVersion, StoreError> {
            Err(StoreError::Storage("read-only".into()))
        }

        fn activate(&self, _id: VersionId, _now: chrono::DateTime<Utc>) -> Result<ContentVersion, StoreError> {
            Err(StoreError::Storage("read-only".into()))
        }

        fn get(&self, _id: VersionId) -> Result<Option<ContentVersion>, StoreError> {
            Ok(None)
        }

        fn delete(&self, _id: VersionId) -> Result<ContentVersion, StoreError> {
            Err(StoreError::Storage("read-only".into()))
        }

        fn list_for_step(&self, _job_id: JobId, _step: StepKind) -> Result<Vec<ContentVersion>, StoreError> {
            Ok(Vec::new())
        }

        fn active_version(&self, _job_id: JobId, _step: StepKind) -> Result<Option<ContentVersion>, StoreError> {
            Ok(None)
        }

        fn count_for_job(&self, _job_id: JobId) -> Result<BTreeMap<StepKind, usize>, StoreError> {
            Ok(BTreeMap::new())
        }
    }

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        versions: Arc<InMemoryVersionStore>,
        ledger: Arc<InMemoryTokenLedger>,
        generator: Arc<ScriptedGenerator>,
        executor: StepExecutor,
        agency: AgencyId,
        job_id: JobId,
    }

    fn fixture(balance: u64, generator: ScriptedGenerator) -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let versions = InMemoryVersionStore::arc();
        let ledger = InMemoryTokenLedger::arc();
        let generator = Arc::new(generator);
        let agency = AgencyId::new();
        ledger.credit(agency, balance).unwrap();

        let request = JobRequest::full_pipeline(ClientId::new(), "summer sale")
            .with_steps(vec![StepKind::IdeaGeneration, StepKind::CopyDesign]);
        let mut job = Job::new(JobId::new(), agency, UserId::new(), &request, |_| 10, Utc::now());
        let reservation = ledger.reserve(agency, job.reserved_tokens, Some(job.id)).unwrap();
        job.attach_reservation(reservation);
        job.start(Utc::now()).unwrap();
        let job_id = job.id;
        jobs.insert(job).unwrap();

        let executor = StepExecutor::new(
            jobs.clone(),
            versions.clone(),
            ledger.clone(),
            generator.clone(),
            Arc::new(JobGates::new()),
            Duration::from_millis(50),
        );
        Fixture {
            jobs,
            versions,
            ledger,
            generator,
            executor,
            agency,
            job_id,
        }
    }

    #[tokio::test]
    async fn success_commits_and_activates_a_version() {
        let f = fixture(100, ScriptedGenerator::new().with_cost(StepKind::IdeaGeneration, 7));
        let outcome = f
            .executor
            .execute(f.agency, f.job_id, StepKind::IdeaGeneration, &CancellationToken::new())
            .await
            .unwrap();

        let StepOutcome::Completed { version_id, token_cost, .. } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(token_cost, 7);
        let active = f.versions.active_version(f.job_id, StepKind::IdeaGeneration).unwrap().unwrap();
        assert_eq!(active.id, version_id);
        assert_eq!(active.number, 1);

        let job = f.jobs.get(f.agency, f.job_id).unwrap().unwrap();
        let step = job.step(StepKind::IdeaGeneration).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.attempts, 1);
        assert_eq!(job.consumed_tokens, 7);
    }

    #[tokio::test]
    async fn next_step_sees_prior_active_output() {
        let f = fixture(100, ScriptedGenerator::new());
        let cancel = CancellationToken::new();
        f.executor.execute(f.agency, f.job_id, StepKind::IdeaGeneration, &cancel).await.unwrap();
        f.executor.execute(f.agency, f.job_id, StepKind::CopyDesign, &cancel).await.unwrap();

        let calls = f.generator.calls();
        assert_eq!(calls[1].prior_steps, vec![StepKind::IdeaGeneration]);
        assert_eq!(calls[1].prior_version_numbers, vec![1]);
    }

    #[tokio::test]
    async fn timeout_is_retryable_and_keeps_step_in_progress() {
        let generator = ScriptedGenerator::new();
        generator.push(StepKind::IdeaGeneration, ScriptedOutcome::Hang);
        let f = fixture(100, generator);

        let outcome = f
            .executor
            .execute(f.agency, f.job_id, StepKind::IdeaGeneration, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Retryable {
                attempt: 1,
                error: GenerationError::Timeout(_)
            }
        ));
        let job = f.jobs.get(f.agency, f.job_id).unwrap().unwrap();
        let step = job.step(StepKind::IdeaGeneration).unwrap();
        assert_eq!(step.status, StepStatus::InProgress);
        assert!(step.last_error.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_refunds_step_share() {
        let generator = ScriptedGenerator::new();
        generator.push(
            StepKind::IdeaGeneration,
            ScriptedOutcome::Fail(GenerationError::Rejected("policy".into())),
        );
        let f = fixture(100, generator);

        let outcome = f
            .executor
            .execute(f.agency, f.job_id, StepKind::IdeaGeneration, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { refunded: 10, .. }));
        assert_eq!(f.ledger.balance_of(f.agency).unwrap(), 90);
        let job = f.jobs.get(f.agency, f.job_id).unwrap().unwrap();
        assert_eq!(job.step(StepKind::IdeaGeneration).unwrap().status, StepStatus::Failed);
        assert_eq!(job.refunded_tokens, 10);
    }

    #[tokio::test]
    async fn overrun_beyond_balance_fails_closed() {
        let f = fixture(25, ScriptedGenerator::new().with_cost(StepKind::IdeaGeneration, 30));
        let outcome = f
            .executor
            .execute(f.agency, f.job_id, StepKind::IdeaGeneration, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert!(f.versions.active_version(f.job_id, StepKind::IdeaGeneration).unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_discards_the_call() {
        let generator = ScriptedGenerator::new();
        generator.push(StepKind::IdeaGeneration, ScriptedOutcome::Hang);
        let f = fixture(100, generator);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f
            .executor
            .execute(f.agency, f.job_id, StepKind::IdeaGeneration, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
        assert_eq!(f.ledger.balance_of(f.agency).unwrap(), 80);
        assert!(f.versions.list_for_step(f.job_id, StepKind::IdeaGeneration).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstored_output_still_charges_the_step() {
        let f = fixture(100, ScriptedGenerator::new().with_cost(StepKind::IdeaGeneration, 7));
        let executor = StepExecutor::new(
            f.jobs.clone(),
            Arc::new(ReadOnlyVersions),
            f.ledger.clone(),
            f.generator.clone(),
            Arc::new(JobGates::new()),
            Duration::from_millis(50),
        );

        let outcome = executor
            .execute(f.agency, f.job_id, StepKind::IdeaGeneration, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { refunded: 3, .. }));

        let job = f.jobs.get(f.agency, f.job_id).unwrap().unwrap();
        let step = job.step(StepKind::IdeaGeneration).unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.tokens_used, 7);
        assert_eq!(job.consumed_tokens, 7);
        assert_eq!(job.refunded_tokens, 3);

        let reservation = f.ledger.reservation(job.reservation_id.unwrap()).unwrap().unwrap();
        assert_eq!(reservation.committed, job.consumed_tokens);
        assert_eq!(f.ledger.balance_of(f.agency).unwrap(), 83);
    }
}
