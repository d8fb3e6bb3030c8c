use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use contentforge_ai::ContentGenerator;
use contentforge_auth::{Permission, Principal, authorize, authorize_for_agency};
use contentforge_core::{AgencyId, JobId, StepKind};
use contentforge_jobs::{Actor, ContentVersion, Job, JobRequest, JobStatus, NewVersion, StepStatus, VersionOrigin};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::TokenLedger;
use crate::pipeline::executor::{StepExecutor, StepOutcome};
use crate::pipeline::gates::{AgencyLimits, JobGates};
use crate::store::{JobStore, VersionStore};

/// Handle to the task driving one run of a job.
struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    config: PipelineConfig,
    jobs: Arc<dyn JobStore>,
    versions: Arc<dyn VersionStore>,
    ledger: Arc<dyn TokenLedger>,
    generator: Arc<dyn ContentGenerator>,
    executor: StepExecutor,
    gates: Arc<JobGates>,
    limits: AgencyLimits,
    runs: Mutex<HashMap<JobId, RunHandle>>,
}

/// Owns the job lifecycle: submission, step sequencing, retries,
/// cancellation and per-agency concurrency.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        config: PipelineConfig,
        jobs: Arc<dyn JobStore>,
        versions: Arc<dyn VersionStore>,
        ledger: Arc<dyn TokenLedger>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        let gates = Arc::new(JobGates::new());
        let executor = StepExecutor::new(
            jobs.clone(),
            versions.clone(),
            ledger.clone(),
            generator.clone(),
            gates.clone(),
            config.step_timeout,
        );
        let limits = AgencyLimits::new(config.max_concurrent_jobs_per_agency);
        Self {
            inner: Arc::new(Inner {
                config,
                jobs,
                versions,
                ledger,
                generator,
                executor,
                gates,
                limits,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Validates and budgets a request, stores the job and starts driving it.
    ///
    /// No job is created when the agency cannot cover the estimate.
    pub async fn submit(&self, principal: &Principal, request: JobRequest) -> PipelineResult<Job> {
        authorize(principal, &Permission::JOBS_SUBMIT)?;
        request.validate()?;

        let inner = &self.inner;
        let agency_id = principal.agency_id();
        let estimates = inner.config.step_estimates;
        let now = Utc::now();
        let mut job = Job::new(JobId::new(), agency_id, principal.principal_id, &request, |k| estimates.get(k), now);

        let reservation_id = inner.ledger.reserve(agency_id, job.reserved_tokens, Some(job.id))?;
        job.attach_reservation(reservation_id);

        let permit = inner.limits.try_acquire(agency_id);
        if permit.is_some() {
            job.start(now)?;
        }
        if let Err(e) = inner.jobs.insert(job.clone()) {
            inner.ledger.release(reservation_id)?;
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            agency_id = %agency_id,
            steps = job.steps.len(),
            reserved = job.reserved_tokens,
            status = %job.status,
            "job submitted"
        );
        self.spawn_run(agency_id, job.id, permit);
        Ok(job)
    }

    /// Cancels a PENDING or IN_PROGRESS job and releases its reservation.
    pub async fn cancel(&self, principal: &Principal, job_id: JobId, reason: Option<String>) -> PipelineResult<Job> {
        let inner = &self.inner;
        let job = self.load_authorized(principal, job_id, &Permission::JOBS_CANCEL)?;

        let job = {
            let _gate = inner.gates.lock(job_id).await;
            let mut job = self.load(job.agency_id, job_id)?;
            if job.is_terminal() {
                return Err(PipelineError::AlreadyTerminal {
                    job_id,
                    status: job.status.to_string(),
                });
            }
            let skipped = job.cancel(reason, Utc::now())?;
            if let Some(reservation_id) = job.reservation_id {
                let released = inner.ledger.release(reservation_id)?;
                job.record_refund(released);
            }
            inner.jobs.update(&mut job)?;
            info!(
                job_id = %job_id,
                skipped = ?skipped,
                refunded = job.refunded_tokens,
                "job cancelled"
            );
            job
        };

        if let Some(run) = self.lock_runs().get(&job_id) {
            run.cancel.cancel();
        }
        Ok(job)
    }

    /// Resumes a FAILED job from its first unfinished step under a new reservation.
    pub async fn retry(&self, principal: &Principal, job_id: JobId) -> PipelineResult<Job> {
        let inner = &self.inner;
        let job = self.load_authorized(principal, job_id, &Permission::JOBS_RETRY)?;
        let agency_id = job.agency_id;

        let (job, permit) = {
            let _gate = inner.gates.lock(job_id).await;
            let mut job = self.load(agency_id, job_id)?;
            if !job.status.is_failed() {
                return Err(PipelineError::NotRetryable {
                    job_id,
                    status: job.status.to_string(),
                });
            }

            let estimates = inner.config.step_estimates;
            let amount = job.retry_estimate(|k| estimates.get(k));
            let reservation_id = inner.ledger.reserve(agency_id, amount, Some(job_id))?;
            let now = Utc::now();
            job.resume(reservation_id, |k| estimates.get(k), now)?;

            let permit = inner.limits.try_acquire(agency_id);
            if permit.is_some() {
                job.start(now)?;
            }
            if let Err(e) = inner.jobs.update(&mut job) {
                inner.ledger.release(reservation_id)?;
                return Err(e.into());
            }
            info!(job_id = %job_id, run = job.run, reserved = amount, status = %job.status, "job retried");
            (job, permit)
        };

        self.spawn_run(agency_id, job_id, permit);
        Ok(job)
    }

    /// Generates a fresh, inactive version of a completed step.
    ///
    /// Only for jobs that are not running. The job status does not change;
    /// the tokens are charged to the job's counters.
    pub async fn regenerate_step(
        &self,
        principal: &Principal,
        job_id: JobId,
        step: StepKind,
    ) -> PipelineResult<ContentVersion> {
        let inner = &self.inner;
        let job = self.load_authorized(principal, job_id, &Permission::VERSIONS_MANAGE)?;
        let agency_id = job.agency_id;

        Self::ensure_regenerable(&job, step)?;

        let estimate = inner.config.step_estimates.get(step);
        let reservation_id = inner.ledger.reserve(agency_id, estimate, Some(job_id))?;
        let context = inner.executor.context(&job, step, 1)?;

        let generated = match tokio::time::timeout(inner.config.step_timeout, inner.generator.generate(&context)).await {
            Ok(Ok(generated)) => generated,
            Ok(Err(e)) => {
                inner.ledger.release(reservation_id)?;
                return Err(e.into());
            }
            Err(_) => {
                inner.ledger.release(reservation_id)?;
                return Err(contentforge_ai::GenerationError::Timeout(inner.config.step_timeout).into());
            }
        };

        // A retry may have restarted the job while the model was running.
        let _gate = inner.gates.lock(job_id).await;
        let mut job = self.load(agency_id, job_id)?;
        if let Err(e) = Self::ensure_regenerable(&job, step) {
            inner.ledger.release(reservation_id)?;
            return Err(e);
        }

        let key = format!("regenerate:{reservation_id}");
        let receipt = match inner.ledger.commit(reservation_id, generated.token_cost, &key) {
            Ok(receipt) => receipt,
            Err(e) => {
                inner.ledger.release(reservation_id)?;
                return Err(e.into());
            }
        };
        let released = inner.ledger.release(reservation_id)?;

        let now = Utc::now();
        job.record_regeneration(step, estimate + receipt.extended_by, receipt.amount, released, now)?;
        let version = inner.versions.create(
            NewVersion {
                job_id,
                agency_id,
                step,
                content: generated.content,
                token_cost: receipt.amount,
                created_by: Actor::User(principal.principal_id),
                origin: VersionOrigin::Regenerated {
                    requested_by: principal.principal_id,
                },
            },
            now,
        )?;
        inner.jobs.update(&mut job)?;

        info!(job_id = %job_id, step = %step, version = version.number, tokens = receipt.amount, "step regenerated");
        Ok(version)
    }

    fn ensure_regenerable(job: &Job, step: StepKind) -> PipelineResult<()> {
        if !job.is_terminal() {
            return Err(PipelineError::Validation(format!(
                "job {} is {} and cannot regenerate steps",
                job.id, job.status
            )));
        }
        let completed = job.step(step).is_some_and(|s| s.status == StepStatus::Completed);
        if !completed {
            return Err(PipelineError::Validation(format!("{step} has no completed output to regenerate")));
        }
        Ok(())
    }

    /// Waits until the job's current run has settled and returns the record.
    pub async fn wait_for(&self, principal: &Principal, job_id: JobId) -> PipelineResult<Job> {
        let job = self.load_authorized(principal, job_id, &Permission::JOBS_READ)?;
        let done = self.lock_runs().get(&job_id).map(|run| run.done.clone());
        if let Some(mut done) = done {
            // A dropped sender means the driver is gone, which is settled too.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.load(job.agency_id, job_id)
    }

    fn load(&self, agency_id: AgencyId, job_id: JobId) -> PipelineResult<Job> {
        self.inner
            .jobs
            .get(agency_id, job_id)?
            .ok_or_else(|| PipelineError::job_not_found(job_id))
    }

    fn load_authorized(&self, principal: &Principal, job_id: JobId, permission: &Permission) -> PipelineResult<Job> {
        authorize(principal, permission)?;
        let job = self.load(principal.agency_id(), job_id)?;
        authorize_for_agency(principal, job.agency_id, permission)?;
        Ok(job)
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, RunHandle>> {
        self.inner.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_run(&self, agency_id: AgencyId, job_id: JobId, permit: Option<OwnedSemaphorePermit>) {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.lock_runs().insert(
            job_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drive(agency_id, job_id, permit, &cancel).await {
                error!(job_id = %job_id, error = %e, "job driver failed");
                this.abort(agency_id, job_id, &e).await;
            }
            let _ = done_tx.send(true);
        });
    }

    /// Runs the job's remaining steps while holding an agency permit.
    async fn drive(
        &self,
        agency_id: AgencyId,
        job_id: JobId,
        permit: Option<OwnedSemaphorePermit>,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let _permit = match permit {
            Some(permit) => permit,
            None => match self.wait_for_permit(agency_id, job_id, cancel).await? {
                Some(permit) => permit,
                None => return Ok(()),
            },
        };

        let policy = &self.inner.config.retry;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let job = self.load(agency_id, job_id)?;
            if job.status != JobStatus::InProgress {
                return Ok(());
            }
            let Some(step) = job.next_step() else {
                return self.finish_completed(agency_id, job_id).await;
            };

            match self.inner.executor.execute(agency_id, job_id, step, cancel).await? {
                StepOutcome::Completed { .. } => {}
                StepOutcome::Cancelled => return Ok(()),
                StepOutcome::Failed { reason, refunded } => {
                    return self.finish_failed(agency_id, job_id, step, reason, refunded).await;
                }
                StepOutcome::Retryable { attempt, error } => {
                    if !policy.should_retry(attempt) {
                        let reason = format!("{error} (gave up after {attempt} attempts)");
                        return match self.inner.executor.fail_step(agency_id, job_id, step, reason).await? {
                            StepOutcome::Failed { reason, refunded } => {
                                self.finish_failed(agency_id, job_id, step, reason, refunded).await
                            }
                            _ => Ok(()),
                        };
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(job_id = %job_id, step = %step, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Waits for a free agency slot, then moves the job to IN_PROGRESS.
    ///
    /// Returns `None` when the job was cancelled while queued.
    async fn wait_for_permit(
        &self,
        agency_id: AgencyId,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<OwnedSemaphorePermit>> {
        let semaphore = self.inner.limits.semaphore(agency_id);
        debug!(job_id = %job_id, agency_id = %agency_id, "job queued for a concurrency slot");
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            permit = semaphore.acquire_owned() => permit
                .map_err(|_| PipelineError::Internal("agency semaphore closed".to_string()))?,
        };

        let _gate = self.inner.gates.lock(job_id).await;
        let mut job = self.load(agency_id, job_id)?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.start(Utc::now())?;
        self.inner.jobs.update(&mut job)?;
        info!(job_id = %job_id, "job started");
        Ok(Some(permit))
    }

    async fn finish_completed(&self, agency_id: AgencyId, job_id: JobId) -> PipelineResult<()> {
        let _gate = self.inner.gates.lock(job_id).await;
        let mut job = self.load(agency_id, job_id)?;
        if job.status != JobStatus::InProgress {
            return Ok(());
        }
        if let Some(reservation_id) = job.reservation_id {
            let released = self.inner.ledger.release(reservation_id)?;
            job.record_refund(released);
        }
        job.complete(Utc::now())?;
        self.inner.jobs.update(&mut job)?;
        info!(
            job_id = %job_id,
            consumed = job.consumed_tokens,
            refunded = job.refunded_tokens,
            "job completed"
        );
        Ok(())
    }

    async fn finish_failed(
        &self,
        agency_id: AgencyId,
        job_id: JobId,
        step: StepKind,
        reason: String,
        step_refund: u64,
    ) -> PipelineResult<()> {
        let _gate = self.inner.gates.lock(job_id).await;
        let mut job = self.load(agency_id, job_id)?;
        if job.status != JobStatus::InProgress {
            return Ok(());
        }
        let released = match job.reservation_id {
            Some(reservation_id) => self.inner.ledger.release(reservation_id)?,
            None => 0,
        };
        job.record_refund(released);
        job.fail(step, reason.as_str(), step_refund + released, Utc::now())?;
        self.inner.jobs.update(&mut job)?;
        warn!(
            job_id = %job_id,
            step = %step,
            refunded = step_refund + released,
            reason = %reason,
            "job failed"
        );
        Ok(())
    }

    /// Best effort: fail the job with the driver error so it does not stay IN_PROGRESS.
    async fn abort(&self, agency_id: AgencyId, job_id: JobId, cause: &PipelineError) {
        let Ok(job) = self.load(agency_id, job_id) else {
            return;
        };
        let Some(step) = job.in_flight_step().or_else(|| job.next_step()) else {
            return;
        };
        let reason = format!("internal error: {cause}");
        let step_refund = match job.step(step).map(|s| s.status) {
            Some(StepStatus::InProgress) => {
                match self.inner.executor.fail_step(agency_id, job_id, step, reason.clone()).await {
                    Ok(StepOutcome::Failed { refunded, .. }) => refunded,
                    _ => 0,
                }
            }
            _ => 0,
        };
        if let Err(e) = self.finish_failed(agency_id, job_id, step, reason, step_refund).await {
            error!(job_id = %job_id, error = %e, "could not mark job failed");
        }
    }
}
