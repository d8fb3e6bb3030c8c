use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use contentforge_core::{AgencyId, CampaignId, ExpectedVersion, JobId};
use contentforge_jobs::{Job, JobStatus};

use super::{StoreError, poisoned};

/// Job record storage, scoped by agency.
pub trait JobStore: Send + Sync {
    /// Stores a new job.
    fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Loads a job owned by `agency_id`.
    ///
    /// A job owned by another agency is reported as a tenant isolation
    /// violation, never returned.
    fn get(&self, agency_id: AgencyId, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Writes `job` back if the stored revision still equals `job.revision`,
    /// then bumps `job.revision` to the new stored revision.
    fn update(&self, job: &mut Job) -> Result<(), StoreError>;

    /// Jobs of a campaign, oldest first.
    fn list_by_campaign(&self, agency_id: AgencyId, campaign_id: CampaignId) -> Result<Vec<Job>, StoreError>;

    fn stats(&self, agency_id: AgencyId) -> Result<JobStats, StoreError>;
}

/// Per-agency job counts and token totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub tokens_reserved: u64,
    pub tokens_consumed: u64,
    pub tokens_refunded: u64,
}

impl JobStats {
    pub fn record(&mut self, job: &Job) {
        self.total += 1;
        match job.status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::InProgress => self.in_progress += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed { .. } => self.failed += 1,
            JobStatus::Cancelled { .. } => self.cancelled += 1,
        }
        self.tokens_reserved += job.reserved_tokens;
        self.tokens_consumed += job.consumed_tokens;
        self.tokens_refunded += job.refunded_tokens;
    }
}

impl<'a> FromIterator<&'a Job> for JobStats {
    fn from_iter<I: IntoIterator<Item = &'a Job>>(iter: I) -> Self {
        let mut stats = JobStats::default();
        for job in iter {
            stats.record(job);
        }
        stats
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn scoped(&self, agency_id: AgencyId, filter: impl Fn(&Job) -> bool) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| j.agency_id == agency_id && filter(j))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, agency_id: AgencyId, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        match jobs.get(&job_id) {
            Some(job) if job.agency_id == agency_id => Ok(Some(job.clone())),
            Some(_) => Err(StoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let stored = jobs.get(&job.id).ok_or(StoreError::JobNotFound(job.id))?;
        if stored.agency_id != job.agency_id {
            return Err(StoreError::TenantIsolation);
        }
        ExpectedVersion::Exact(job.revision)
            .check(stored.revision)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;

        job.revision += 1;
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn list_by_campaign(&self, agency_id: AgencyId, campaign_id: CampaignId) -> Result<Vec<Job>, StoreError> {
        self.scoped(agency_id, |j| j.campaign_id == Some(campaign_id))
    }

    fn stats(&self, agency_id: AgencyId) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.values().filter(|j| j.agency_id == agency_id).collect())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert(&self, job: Job) -> Result<(), StoreError> {
        (**self).insert(job)
    }

    fn get(&self, agency_id: AgencyId, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(agency_id, job_id)
    }

    fn update(&self, job: &mut Job) -> Result<(), StoreError> {
        (**self).update(job)
    }

    fn list_by_campaign(&self, agency_id: AgencyId, campaign_id: CampaignId) -> Result<Vec<Job>, StoreError> {
        (**self).list_by_campaign(agency_id, campaign_id)
    }

    fn stats(&self, agency_id: AgencyId) -> Result<JobStats, StoreError> {
        (**self).stats(agency_id)
    }
}
