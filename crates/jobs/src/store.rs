//! Job storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quotaflow_core::{EngineError, ExpectedVersion, JobId, TenantId};

use crate::types::{Job, JobState};

/// Stable position in a tenant's job listing (creation order, id as tiebreak).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListPosition {
    pub created_at: DateTime<Utc>,
    pub job_id: JobId,
}

impl ListPosition {
    pub fn of(job: &Job) -> Self {
        Self {
            created_at: job.created_at,
            job_id: job.id,
        }
    }
}

/// Job store abstraction.
///
/// `save` is a compare-and-swap: it succeeds only while the stored version
/// still matches `expected`, and bumps the version on success.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Store `job` and return the stored copy (with its new version).
    fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError>;

    /// Up to `limit` jobs of a tenant strictly after `after`, in creation order.
    fn page_by_tenant(
        &self,
        tenant_id: TenantId,
        after: Option<ListPosition>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// All jobs currently in `state`, in creation order.
    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError>;

    fn counts(&self) -> Result<JobCounts, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        (**self).insert(job)
    }

    fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).load(job_id)
    }

    fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        (**self).save(job, expected)
    }

    fn page_by_tenant(
        &self,
        tenant_id: TenantId,
        after: Option<ListPosition>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).page_by_tenant(tenant_id, after, limit)
    }

    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(state)
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        (**self).counts()
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("version conflict on job {job_id}: expected {expected:?}, found {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for EngineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => EngineError::JobNotFound(id),
            JobStoreError::AlreadyExists(id) => EngineError::conflict(format!("job already exists: {id}")),
            e @ JobStoreError::VersionConflict { .. } => EngineError::conflict(e.to_string()),
            JobStoreError::Storage(msg) => EngineError::Storage(msg),
        }
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub stopped: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Queued => self.queued,
            JobState::Running => self.running,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Stopped => self.stopped,
        }
    }

    fn set(&mut self, state: JobState, value: u64) {
        match state {
            JobState::Queued => self.queued = value,
            JobState::Running => self.running = value,
            JobState::Completed => self.completed = value,
            JobState::Failed => self.failed = value,
            JobState::Stopped => self.stopped = value,
        }
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// In-memory job store.
///
/// Each job sits behind its own mutex; the tenant and state indexes are
/// secondary and only touched on insert and on state changes.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
    by_tenant: RwLock<HashMap<TenantId, BTreeSet<ListPosition>>>,
    by_state: Mutex<HashMap<JobState, BTreeSet<ListPosition>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn entry(&self, job_id: JobId) -> Result<Option<Arc<Mutex<Job>>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn load_all(&self, positions: impl IntoIterator<Item = ListPosition>) -> Result<Vec<Job>, JobStoreError> {
        let mut out = Vec::new();
        for pos in positions {
            if let Some(entry) = self.entry(pos.job_id)? {
                out.push(entry.lock().map_err(|_| poisoned())?.clone());
            }
        }
        Ok(out)
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let pos = ListPosition::of(&job);
        self.by_tenant
            .write()
            .map_err(|_| poisoned())?
            .entry(job.tenant_id)
            .or_default()
            .insert(pos);
        self.by_state
            .lock()
            .map_err(|_| poisoned())?
            .entry(job.state)
            .or_default()
            .insert(pos);
        jobs.insert(job.id, Arc::new(Mutex::new(job)));
        Ok(())
    }

    fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.entry(job_id)? {
            Some(entry) => Ok(Some(entry.lock().map_err(|_| poisoned())?.clone())),
            None => Ok(None),
        }
    }

    fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let entry = self.entry(job.id)?.ok_or(JobStoreError::NotFound(job.id))?;
        let mut stored = entry.lock().map_err(|_| poisoned())?;

        if !expected.matches(stored.version) {
            return Err(JobStoreError::VersionConflict {
                job_id: job.id,
                expected,
                actual: stored.version,
            });
        }

        let previous_state = stored.state;
        let mut next = job.clone();
        next.version = stored.version + 1;

        if previous_state != next.state {
            let pos = ListPosition::of(&next);
            let mut by_state = self.by_state.lock().map_err(|_| poisoned())?;
            if let Some(set) = by_state.get_mut(&previous_state) {
                set.remove(&pos);
            }
            by_state.entry(next.state).or_default().insert(pos);
        }

        *stored = next.clone();
        Ok(next)
    }

    fn page_by_tenant(
        &self,
        tenant_id: TenantId,
        after: Option<ListPosition>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let positions: Vec<ListPosition> = {
            let by_tenant = self.by_tenant.read().map_err(|_| poisoned())?;
            match by_tenant.get(&tenant_id) {
                Some(set) => match after {
                    Some(after) => set
                        .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                        .take(limit)
                        .copied()
                        .collect(),
                    None => set.iter().take(limit).copied().collect(),
                },
                None => Vec::new(),
            }
        };
        self.load_all(positions)
    }

    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        let positions: Vec<ListPosition> = {
            let by_state = self.by_state.lock().map_err(|_| poisoned())?;
            by_state
                .get(&state)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        // The index is read without holding job locks; re-check each job.
        Ok(self
            .load_all(positions)?
            .into_iter()
            .filter(|job| job.state == state)
            .collect())
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let by_state = self.by_state.lock().map_err(|_| poisoned())?;
        let mut counts = JobCounts::default();
        for (state, set) in by_state.iter() {
            counts.set(*state, set.len() as u64);
        }
        Ok(counts)
    }
}
