//! Engine error model.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::JobId;
use crate::resource::ResourceKind;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Details of a denied reservation, shaped for "X/Y tokens used" displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDenial {
    pub resource: ResourceKind,
    /// Reserved plus consumed at the time of the check.
    pub used: u64,
    pub requested: u64,
    pub limit: u64,
}

impl QuotaDenial {
    /// Usage the caller would have reached had the request been admitted.
    pub fn would_use(&self) -> u64 {
        self.used.saturating_add(self.requested)
    }
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} used (requested {})",
            self.would_use(),
            self.limit,
            self.resource.unit(),
            self.requested
        )
    }
}

/// Engine-level error.
///
/// Quota and validation failures are returned synchronously to callers.
/// Stale progress reports are surfaced here by the tracker but are ignored one
/// layer up.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// A reservation would push reserved + consumed past the limit.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaDenial),

    /// The tier's model allowance is used up.
    #[error("model limit reached: {in_use}/{limit} models")]
    ModelLimitReached { in_use: u64, limit: u64 },

    /// The state table does not allow this transition (or a racing caller won).
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: String,
        to: String,
    },

    /// The external executor could not start the job.
    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),

    /// A progress report older than the latest applied one.
    #[error("stale progress report for job {job_id}: seq {seq} <= {last_seq}")]
    StaleProgressReport { job_id: JobId, last_seq: u64, seq: u64 },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// A value failed validation (malformed input, unknown reservation, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic concurrency conflict that could not be resolved.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invalid_transition(job_id: JobId, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidTransition {
            job_id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Poisoned lock; the guarded state can no longer be trusted.
    pub fn poisoned() -> Self {
        Self::Storage("lock poisoned".to_string())
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, EngineError::QuotaExceeded(_))
    }
}
