use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use contentforge_core::{JobId, StepKind, VersionId};
use contentforge_jobs::{ContentVersion, ExecutionKey, NewVersion, VersionError};

use super::{StoreError, poisoned};

/// Append-only version storage with one active version per (job, step).
pub trait VersionStore: Send + Sync {
    /// Stores a new, inactive version with the next number for its (job, step).
    ///
    /// A pipeline version whose execution key was already stored is not
    /// duplicated; the existing version is returned instead.
    fn create(&self, new: NewVersion, now: DateTime<Utc>) -> Result<ContentVersion, StoreError>;

    /// Makes `version_id` the active version of its (job, step), deactivating
    /// the previous one in the same write.
    fn activate(&self, version_id: VersionId, now: DateTime<Utc>) -> Result<ContentVersion, StoreError>;

    fn get(&self, version_id: VersionId) -> Result<Option<ContentVersion>, StoreError>;

    /// Removes an inactive version. Its number is never handed out again.
    fn delete(&self, version_id: VersionId) -> Result<ContentVersion, StoreError>;

    /// Versions of one step, ordered by number.
    fn list_for_step(&self, job_id: JobId, step: StepKind) -> Result<Vec<ContentVersion>, StoreError>;

    fn active_version(&self, job_id: JobId, step: StepKind) -> Result<Option<ContentVersion>, StoreError>;

    /// Number of stored versions per step of a job.
    fn count_for_job(&self, job_id: JobId) -> Result<BTreeMap<StepKind, usize>, StoreError>;
}

type StepSlot = (JobId, StepKind);

#[derive(Debug, Default)]
struct Versions {
    by_id: HashMap<VersionId, ContentVersion>,
    by_slot: HashMap<StepSlot, Vec<VersionId>>,
    active: HashMap<StepSlot, VersionId>,
    last_number: HashMap<StepSlot, u32>,
    by_key: HashMap<ExecutionKey, VersionId>,
}

impl Versions {
    fn require(&self, version_id: VersionId) -> Result<&ContentVersion, StoreError> {
        self.by_id
            .get(&version_id)
            .ok_or(StoreError::VersionNotFound(version_id))
    }
}

/// In-memory version store for tests/dev.
///
/// All indexes sit behind a single lock so that activation swaps the active
/// version atomically.
#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    inner: RwLock<Versions>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl VersionStore for InMemoryVersionStore {
    fn create(&self, new: NewVersion, now: DateTime<Utc>) -> Result<ContentVersion, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        let key = new.origin.execution_key().copied();
        if let Some(existing) = key.and_then(|k| inner.by_key.get(&k)) {
            return Ok(inner.require(*existing)?.clone());
        }

        let slot = (new.job_id, new.step);
        let number = inner.last_number.get(&slot).copied().unwrap_or(0) + 1;
        let version = new.into_version(VersionId::new(), number, now);

        inner.last_number.insert(slot, number);
        inner.by_slot.entry(slot).or_default().push(version.id);
        if let Some(key) = key {
            inner.by_key.insert(key, version.id);
        }
        inner.by_id.insert(version.id, version.clone());
        Ok(version)
    }

    fn activate(&self, version_id: VersionId, now: DateTime<Utc>) -> Result<ContentVersion, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let target = inner.require(version_id)?;
        let slot = (target.job_id, target.step);
        if target.is_active {
            return Ok(target.clone());
        }

        if let Some(previous) = inner.active.insert(slot, version_id) {
            if let Some(prev) = inner.by_id.get_mut(&previous) {
                prev.is_active = false;
            }
        }
        let version = inner
            .by_id
            .get_mut(&version_id)
            .ok_or(StoreError::VersionNotFound(version_id))?;
        version.is_active = true;
        version.activated_at = Some(now);
        Ok(version.clone())
    }

    fn get(&self, version_id: VersionId) -> Result<Option<ContentVersion>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.by_id.get(&version_id).cloned())
    }

    fn delete(&self, version_id: VersionId) -> Result<ContentVersion, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.require(version_id)?.is_active {
            return Err(VersionError::CannotDeleteActive(version_id).into());
        }
        let version = inner
            .by_id
            .remove(&version_id)
            .ok_or(StoreError::VersionNotFound(version_id))?;

        let slot = (version.job_id, version.step);
        if let Some(ids) = inner.by_slot.get_mut(&slot) {
            ids.retain(|id| *id != version_id);
        }
        if let Some(key) = version.origin.execution_key() {
            inner.by_key.remove(key);
        }
        Ok(version)
    }

    fn list_for_step(&self, job_id: JobId, step: StepKind) -> Result<Vec<ContentVersion>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let ids = inner.by_slot.get(&(job_id, step)).map(Vec::as_slice).unwrap_or_default();
        Ok(ids.iter().filter_map(|id| inner.by_id.get(id)).cloned().collect())
    }

    fn active_version(&self, job_id: JobId, step: StepKind) -> Result<Option<ContentVersion>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .active
            .get(&(job_id, step))
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    fn count_for_job(&self, job_id: JobId) -> Result<BTreeMap<StepKind, usize>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .by_slot
            .iter()
            .filter(|((job, _), ids)| *job == job_id && !ids.is_empty())
            .map(|((_, step), ids)| (*step, ids.len()))
            .collect())
    }
}

impl<S: VersionStore + ?Sized> VersionStore for Arc<S> {
    fn create(&self, new: NewVersion, now: DateTime<Utc>) -> Result<ContentVersion, StoreError> {
        (**self).create(new, now)
    }

    fn activate(&self, version_id: VersionId, now: DateTime<Utc>) -> Result<ContentVersion, StoreError> {
        (**self).activate(version_id, now)
    }

    fn get(&self, version_id: VersionId) -> Result<Option<ContentVersion>, StoreError> {
        (**self).get(version_id)
    }

    fn delete(&self, version_id: VersionId) -> Result<ContentVersion, StoreError> {
        (**self).delete(version_id)
    }

    fn list_for_step(&self, job_id: JobId, step: StepKind) -> Result<Vec<ContentVersion>, StoreError> {
        (**self).list_for_step(job_id, step)
    }

    fn active_version(&self, job_id: JobId, step: StepKind) -> Result<Option<ContentVersion>, StoreError> {
        (**self).active_version(job_id, step)
    }

    fn count_for_job(&self, job_id: JobId) -> Result<BTreeMap<StepKind, usize>, StoreError> {
        (**self).count_for_job(job_id)
    }
}
