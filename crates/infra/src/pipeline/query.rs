use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use contentforge_auth::{Permission, Principal, authorize, authorize_for_agency};
use contentforge_core::{AgencyId, CampaignId, ClientId, JobId, StepKind, VersionId};
use contentforge_jobs::{ContentVersion, Job, JobStatus, StepStatus, VersionComparison, VersionError, VersionSummary, compare_versions};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::store::{JobStats, JobStore, VersionStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub step: StepKind,
    pub status: StepStatus,
    pub attempts: u32,
    pub reserved_tokens: u64,
    pub tokens_used: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_version_id: Option<VersionId>,
    pub version_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub agency_id: AgencyId,
    pub client_id: ClientId,
    pub campaign_id: Option<CampaignId>,
    pub status: JobStatus,
    pub run: u32,
    pub steps: Vec<StepView>,
    pub reserved_tokens: u64,
    pub consumed_tokens: u64,
    pub refunded_tokens: u64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignJobsView {
    pub campaign_id: CampaignId,
    pub jobs: Vec<JobStatusView>,
    pub counts: StatusCounts,
    pub consumed_tokens: u64,
    pub refunded_tokens: u64,
    pub total_cost: f64,
}

/// Read side of the pipeline plus version management.
///
/// Every view is built from one job record read, so job and step data in a
/// view always belong to the same revision.
#[derive(Clone)]
pub struct JobQuery {
    config: PipelineConfig,
    jobs: Arc<dyn JobStore>,
    versions: Arc<dyn VersionStore>,
}

impl JobQuery {
    pub fn new(config: PipelineConfig, jobs: Arc<dyn JobStore>, versions: Arc<dyn VersionStore>) -> Self {
        Self { config, jobs, versions }
    }

    pub fn get_job_status(&self, principal: &Principal, job_id: JobId) -> PipelineResult<JobStatusView> {
        authorize(principal, &Permission::JOBS_READ)?;
        let job = self
            .jobs
            .get(principal.agency_id(), job_id)?
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;
        authorize_for_agency(principal, job.agency_id, &Permission::JOBS_READ)?;
        self.view(&job)
    }

    pub fn get_campaign_jobs(&self, principal: &Principal, campaign_id: CampaignId) -> PipelineResult<CampaignJobsView> {
        authorize(principal, &Permission::JOBS_READ)?;
        let jobs = self.jobs.list_by_campaign(principal.agency_id(), campaign_id)?;

        let mut counts = StatusCounts::default();
        let mut views = Vec::with_capacity(jobs.len());
        for job in &jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::InProgress => counts.in_progress += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed { .. } => counts.failed += 1,
                JobStatus::Cancelled { .. } => counts.cancelled += 1,
            }
            views.push(self.view(job)?);
        }
        let consumed_tokens: u64 = jobs.iter().map(|j| j.consumed_tokens).sum();
        let refunded_tokens: u64 = jobs.iter().map(|j| j.refunded_tokens).sum();

        Ok(CampaignJobsView {
            campaign_id,
            jobs: views,
            counts,
            consumed_tokens,
            refunded_tokens,
            total_cost: self.config.cost_of(consumed_tokens),
        })
    }

    pub fn get_agency_stats(&self, principal: &Principal) -> PipelineResult<JobStats> {
        authorize(principal, &Permission::JOBS_READ)?;
        Ok(self.jobs.stats(principal.agency_id())?)
    }

    pub fn get_version(&self, principal: &Principal, version_id: VersionId) -> PipelineResult<ContentVersion> {
        self.load_version(principal, version_id, &Permission::JOBS_READ)
    }

    pub fn list_versions(&self, principal: &Principal, job_id: JobId, step: StepKind) -> PipelineResult<Vec<VersionSummary>> {
        authorize(principal, &Permission::JOBS_READ)?;
        // Ownership check goes through the job record.
        self.jobs
            .get(principal.agency_id(), job_id)?
            .ok_or_else(|| PipelineError::job_not_found(job_id))?;
        Ok(self
            .versions
            .list_for_step(job_id, step)?
            .iter()
            .map(ContentVersion::summary)
            .collect())
    }

    /// Makes a version the active output of its step.
    pub fn activate_version(&self, principal: &Principal, version_id: VersionId) -> PipelineResult<ContentVersion> {
        self.load_version(principal, version_id, &Permission::VERSIONS_MANAGE)?;
        Ok(self.versions.activate(version_id, Utc::now())?)
    }

    pub fn compare_versions(&self, principal: &Principal, left: VersionId, right: VersionId) -> PipelineResult<VersionComparison> {
        if left == right {
            return Err(VersionError::SameVersion(left).into());
        }
        let a = self.load_version(principal, left, &Permission::JOBS_READ)?;
        let b = self.load_version(principal, right, &Permission::JOBS_READ)?;
        Ok(compare_versions(&a, &b)?)
    }

    pub fn delete_version(&self, principal: &Principal, version_id: VersionId) -> PipelineResult<ContentVersion> {
        self.load_version(principal, version_id, &Permission::VERSIONS_MANAGE)?;
        Ok(self.versions.delete(version_id)?)
    }

    fn load_version(&self, principal: &Principal, version_id: VersionId, permission: &Permission) -> PipelineResult<ContentVersion> {
        authorize(principal, permission)?;
        let version = self
            .versions
            .get(version_id)?
            .ok_or_else(|| PipelineError::version_not_found(version_id))?;
        authorize_for_agency(principal, version.agency_id, permission)?;
        Ok(version)
    }

    fn view(&self, job: &Job) -> PipelineResult<JobStatusView> {
        let counts = self.versions.count_for_job(job.id)?;
        let mut steps = Vec::with_capacity(job.steps.len());
        for step in &job.steps {
            steps.push(StepView {
                step: step.kind,
                status: step.status,
                attempts: step.attempts,
                reserved_tokens: step.reserved_tokens,
                tokens_used: step.tokens_used,
                started_at: step.started_at,
                executed_at: step.executed_at,
                last_error: step.last_error.clone(),
                active_version_id: self.versions.active_version(job.id, step.kind)?.map(|v| v.id),
                version_count: counts.get(&step.kind).copied().unwrap_or(0),
            });
        }

        Ok(JobStatusView {
            job_id: job.id,
            agency_id: job.agency_id,
            client_id: job.client_id,
            campaign_id: job.campaign_id,
            status: job.status.clone(),
            run: job.run,
            steps,
            reserved_tokens: job.reserved_tokens,
            consumed_tokens: job.consumed_tokens,
            refunded_tokens: job.refunded_tokens,
            total_cost: self.config.cost_of(job.consumed_tokens),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        })
    }
}
