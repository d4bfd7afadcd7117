//! The external runner jobs are started on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use quotaflow_core::{JobId, ResourceUsage, TenantId};

use crate::types::{Job, JobKind};

/// Everything an executor needs to start a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStart {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub estimate: ResourceUsage,
    /// 1 for the first start, higher for start-up retries.
    pub attempt: u32,
}

impl From<&Job> for JobStart {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id,
            kind: job.kind.clone(),
            estimate: job.estimate.clone(),
            attempt: job.start_attempts,
        }
    }
}

/// Why an executor could not start a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Transient; the scheduler retries with backoff.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
    /// Permanent; the job fails immediately.
    #[error("executor rejected job: {0}")]
    Rejected(String),
}

/// Training / ingestion runner.
///
/// `start` only hands the job over; the executor reports progress and the
/// terminal outcome back through the registry, at least once.
pub trait JobExecutor: Send + Sync {
    fn start(&self, job: &JobStart) -> Result<(), ExecutorError>;

    /// Best-effort cancellation of a started job.
    fn cancel(&self, _job_id: JobId) {}
}

impl<E> JobExecutor for Arc<E>
where
    E: JobExecutor + ?Sized,
{
    fn start(&self, job: &JobStart) -> Result<(), ExecutorError> {
        (**self).start(job)
    }

    fn cancel(&self, job_id: JobId) {
        (**self).cancel(job_id)
    }
}
