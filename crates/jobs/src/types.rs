//! Core job types and the state table.

use core::fmt;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quotaflow_core::{JobId, ReservationId, ResourceUsage, TenantId};

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobKind {
    /// Model fine-tuning run
    Training { model_name: String },
    /// Data-ingestion batch
    Ingestion { source: String },
}

impl JobKind {
    pub fn training(model_name: impl Into<String>) -> Self {
        Self::Training {
            model_name: model_name.into(),
        }
    }

    pub fn ingestion(source: impl Into<String>) -> Self {
        Self::Ingestion {
            source: source.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Training { .. } => "training",
            JobKind::Ingestion { .. } => "ingestion",
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, JobKind::Training { .. })
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted by quota, waiting for capacity
    Queued,
    /// Started on an executor
    Running,
    /// Executor reported success
    Completed,
    /// Executor reported a fatal error (or could not start it)
    Failed,
    /// Cancelled by the user
    Stopped,
}

/// Outcome of checking a requested transition against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Apply,
    /// Repeated terminal state; at-least-once callbacks land here.
    AlreadyThere,
    Invalid,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Stopped,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        }
    }

    /// Public transition table.
    ///
    /// `running → queued` (start-up retry) is deliberately absent; only the
    /// scheduler takes that edge.
    pub fn step_to(self, target: JobState) -> Step {
        use JobState::*;
        match (self, target) {
            (Queued, Running) | (Queued, Stopped) => Step::Apply,
            (Running, Completed) | (Running, Failed) | (Running, Stopped) => Step::Apply,
            (from, to) if from == to && from.is_terminal() => Step::AlreadyThere,
            _ => Step::Invalid,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra data carried by a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionInfo {
    /// Actual consumption, settled against the reservation on completion/failure.
    pub actual: Option<ResourceUsage>,
    pub error: Option<String>,
}

impl TransitionInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn completed(actual: ResourceUsage) -> Self {
        Self {
            actual: Some(actual),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, actual: Option<ResourceUsage>) -> Self {
        Self {
            actual,
            error: Some(error.into()),
        }
    }
}

/// Entries kept in a job's log; the oldest go first.
pub const JOB_LOG_CAPACITY: usize = 100;

/// One line of a job's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A unit of long-running work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub state: JobState,
    /// Higher runs first within a tenant; equal priorities are FIFO.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest admission into `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, on entering a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    pub reservation_id: ReservationId,
    pub estimate: ResourceUsage,
    pub actual: Option<ResourceUsage>,
    pub last_error: Option<String>,
    /// Number of times the scheduler has tried to start the job.
    pub start_attempts: u32,
    /// Earliest time the scheduler may admit the job again (start-up backoff).
    pub not_before: Option<DateTime<Utc>>,
    /// Actual usage exceeded the limit and was only partly charged.
    pub overage: bool,
    /// The reservation has been finalized or released.
    #[serde(default)]
    pub settled: bool,
    /// Transitions plus executor-supplied lines, newest last.
    #[serde(default)]
    pub log: VecDeque<JobLogEntry>,
    pub version: u64,
}

impl Job {
    pub fn new(
        tenant_id: TenantId,
        kind: JobKind,
        estimate: ResourceUsage,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self {
            id: JobId::new(),
            tenant_id,
            kind,
            state: JobState::Queued,
            priority: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            reservation_id,
            estimate,
            actual: None,
            last_error: None,
            start_attempts: 0,
            not_before: None,
            overage: false,
            settled: false,
            log: VecDeque::new(),
            version: 0,
        };
        job.log("submitted", now);
        job
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the scheduler may admit the job at `now`.
    pub fn is_admissible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.not_before.is_none_or(|at| now >= at)
    }

    /// Append to the job log, dropping the oldest entry when full.
    pub(crate) fn log(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.log.len() >= JOB_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(JobLogEntry {
            at: now,
            message: message.into(),
        });
    }

    /// Apply a transition the table already approved.
    pub(crate) fn enter(&mut self, target: JobState, info: &TransitionInfo, now: DateTime<Utc>) {
        match &info.error {
            Some(error) => self.log(format!("{} -> {target}: {error}", self.state), now),
            None => self.log(format!("{} -> {target}", self.state), now),
        }
        self.state = target;
        self.updated_at = now;
        match target {
            JobState::Running => {
                self.started_at = Some(now);
                self.start_attempts += 1;
                self.not_before = None;
            }
            JobState::Completed | JobState::Failed | JobState::Stopped => {
                if self.ended_at.is_none() {
                    self.ended_at = Some(now);
                }
                if let Some(actual) = &info.actual {
                    self.actual = Some(actual.clone());
                }
                if let Some(error) = &info.error {
                    self.last_error = Some(error.clone());
                }
            }
            JobState::Queued => {}
        }
    }

    /// Scheduler-only `running → queued` edge after a failed start.
    pub(crate) fn requeue(&mut self, error: String, not_before: DateTime<Utc>, now: DateTime<Utc>) {
        self.log(format!("requeued until {not_before}: {error}"), now);
        self.state = JobState::Queued;
        self.updated_at = now;
        self.started_at = None;
        self.last_error = Some(error);
        self.not_before = Some(not_before);
    }
}
