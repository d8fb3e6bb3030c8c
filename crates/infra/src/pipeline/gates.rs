use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use contentforge_core::{AgencyId, JobId};

/// Per-job async gates.
///
/// Every read-modify-write of a job record happens while holding the job's
/// gate, so a cancel and a late step result are applied one after the other.
#[derive(Debug, Default)]
pub struct JobGates {
    gates: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, job_id: JobId) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
            gates.entry(job_id).or_default().clone()
        };
        gate.lock_owned().await
    }
}

/// One semaphore per agency bounding its IN_PROGRESS jobs.
#[derive(Debug)]
pub struct AgencyLimits {
    permits_per_agency: usize,
    semaphores: Mutex<HashMap<AgencyId, Arc<Semaphore>>>,
}

impl AgencyLimits {
    pub fn new(permits_per_agency: usize) -> Self {
        Self {
            permits_per_agency,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub fn semaphore(&self, agency_id: AgencyId) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap_or_else(|p| p.into_inner());
        semaphores
            .entry(agency_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_agency)))
            .clone()
    }

    /// A permit if one is free right now.
    pub fn try_acquire(&self, agency_id: AgencyId) -> Option<OwnedSemaphorePermit> {
        self.semaphore(agency_id).try_acquire_owned().ok()
    }

    pub fn available(&self, agency_id: AgencyId) -> usize {
        self.semaphore(agency_id).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_serializes_holders_of_one_job() {
        let gates = Arc::new(JobGates::new());
        let job = JobId::new();
        let guard = gates.lock(job).await;

        let waiter = {
            let gates = gates.clone();
            tokio::spawn(async move {
                let _g = gates.lock(job).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _other = gates.lock(JobId::new()).await;
        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn permits_are_per_agency() {
        let limits = AgencyLimits::new(1);
        let a = AgencyId::new();
        let held = limits.try_acquire(a);
        assert!(held.is_some());
        assert!(limits.try_acquire(a).is_none());
        assert!(limits.try_acquire(AgencyId::new()).is_some());
        drop(held);
        assert_eq!(limits.available(a), 1);
    }
}
