//! Admission of queued jobs into `running`.
//!
//! Each tick walks tenants round-robin (ordered by their oldest admissible
//! job) and admits one job per tenant per round until global capacity runs
//! out. A busy tenant therefore cannot starve a quiet one, while each
//! tenant's own queue stays in priority-then-FIFO order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use quotaflow_core::{EngineError, EngineResult, JobId, TenantId};
use quotaflow_quota::Limit;

use crate::executor::{ExecutorError, JobExecutor, JobStart};
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use crate::types::{Job, JobState, TransitionInfo};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs running at once across all tenants.
    pub global_capacity: usize,
    /// Start-up retry for `ExecutorError::Unavailable`.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_capacity: 16,
            retry: RetryPolicy::default(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub admitted: Vec<JobId>,
    /// Executor was unavailable; waiting out the backoff.
    pub requeued: Vec<JobId>,
    /// Could not be started and gave up.
    pub failed: Vec<JobId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.requeued.is_empty() && self.failed.is_empty()
    }
}

enum Admission {
    Started,
    Requeued,
    Failed,
    /// Changed state under us (usually stopped); nothing to do.
    Skipped,
}

/// One tenant's admissible jobs for this tick.
struct Lane {
    tenant_id: TenantId,
    oldest: DateTime<Utc>,
    cap: Limit,
    jobs: VecDeque<Job>,
}

pub struct JobScheduler {
    registry: Arc<JobRegistry>,
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
    tick_lock: Mutex<()>,
}

impl JobScheduler {
    pub fn new(registry: Arc<JobRegistry>, executor: Arc<dyn JobExecutor>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            executor,
            config,
            tick_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Best-effort cancellation on the executor after a stop.
    pub fn cancel(&self, job_id: JobId) {
        self.executor.cancel(job_id);
    }

    /// Run one admission pass.
    pub fn tick(&self) -> EngineResult<TickReport> {
        let _guard = self.tick_lock.lock().map_err(|_| EngineError::poisoned())?;
        let now = self.registry.clock().now();
        let mut report = TickReport::default();

        let running = self.registry.jobs_in_state(JobState::Running)?;
        let mut capacity = self.config.global_capacity.saturating_sub(running.len());
        if capacity == 0 {
            debug!(running = running.len(), "scheduler at global capacity");
            return Ok(report);
        }

        let mut running_by_tenant: HashMap<TenantId, u64> = HashMap::new();
        for job in &running {
            *running_by_tenant.entry(job.tenant_id).or_default() += 1;
        }

        let mut lanes = self.lanes(now)?;

        while capacity > 0 {
            let mut progressed = false;
            for lane in lanes.iter_mut() {
                if capacity == 0 {
                    break;
                }
                let in_flight = running_by_tenant.get(&lane.tenant_id).copied().unwrap_or(0);
                if !lane.cap.allows(in_flight + 1) {
                    continue;
                }
                let Some(job) = lane.jobs.pop_front() else {
                    continue;
                };
                progressed = true;

                match self.admit(&job, now) {
                    Ok(Admission::Started) => {
                        capacity -= 1;
                        *running_by_tenant.entry(lane.tenant_id).or_default() += 1;
                        report.admitted.push(job.id);
                    }
                    Ok(Admission::Requeued) => report.requeued.push(job.id),
                    Ok(Admission::Failed) => report.failed.push(job.id),
                    Ok(Admission::Skipped) => {}
                    Err(e) => error!(job_id = %job.id, error = %e, "admission failed"),
                }
            }
            if !progressed {
                break;
            }
        }

        if !report.is_empty() {
            info!(
                admitted = report.admitted.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "scheduler tick"
            );
        }
        Ok(report)
    }

    /// Group admissible jobs by tenant, in admission order.
    fn lanes(&self, now: DateTime<Utc>) -> EngineResult<Vec<Lane>> {
        let mut by_tenant: HashMap<TenantId, Vec<Job>> = HashMap::new();
        for job in self.registry.jobs_in_state(JobState::Queued)? {
            if job.is_admissible(now) {
                by_tenant.entry(job.tenant_id).or_default().push(job);
            }
        }

        let mut lanes = Vec::with_capacity(by_tenant.len());
        for (tenant_id, mut jobs) in by_tenant {
            let cap = match self.registry.meter().max_concurrent_jobs(tenant_id) {
                Ok(cap) => cap,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "skipping tenant");
                    continue;
                }
            };
            let Some(oldest) = jobs.iter().map(|j| j.created_at).min() else {
                continue;
            };
            jobs.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });
            lanes.push(Lane {
                tenant_id,
                oldest,
                cap,
                jobs: jobs.into(),
            });
        }
        lanes.sort_by(|a, b| a.oldest.cmp(&b.oldest).then(a.tenant_id.cmp(&b.tenant_id)));
        Ok(lanes)
    }

    fn admit(&self, job: &Job, now: DateTime<Utc>) -> EngineResult<Admission> {
        let running = match self
            .registry
            .transition(job.id, JobState::Running, TransitionInfo::none())
        {
            Ok(job) => job,
            Err(EngineError::InvalidTransition { .. }) => return Ok(Admission::Skipped),
            Err(e) => return Err(e),
        };

        let start = JobStart::from(&running);
        match self.executor.start(&start) {
            Ok(()) => {
                // A stop may have landed between the `running` write and the start.
                if self.registry.get(job.id)?.state == JobState::Stopped {
                    debug!(job_id = %job.id, "job stopped while starting; cancelling");
                    self.executor.cancel(job.id);
                    return Ok(Admission::Skipped);
                }
                info!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    attempt = start.attempt,
                    "job started"
                );
                Ok(Admission::Started)
            }
            Err(ExecutorError::Unavailable(reason)) => {
                let reason = EngineError::ExecutorUnavailable(reason).to_string();
                let failures = running.start_attempts;
                if !self.config.retry.should_retry(failures) {
                    return self.give_up(job.id, reason);
                }
                let delay = self.config.retry.delay_for(job.id, failures);
                let not_before = now + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(
                    job_id = %job.id,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "executor unavailable; will retry"
                );
                match self.registry.requeue(job.id, reason, not_before) {
                    Ok(_) => Ok(Admission::Requeued),
                    Err(EngineError::InvalidTransition { .. }) => Ok(Admission::Skipped),
                    Err(e) => Err(e),
                }
            }
            Err(e @ ExecutorError::Rejected(_)) => self.give_up(job.id, e.to_string()),
        }
    }

    fn give_up(&self, job_id: JobId, reason: String) -> EngineResult<Admission> {
        warn!(job_id = %job_id, error = %reason, "job could not be started");
        match self.registry.fail(job_id, reason, None) {
            Ok(job) if job.state == JobState::Failed => Ok(Admission::Failed),
            Ok(_) => Ok(Admission::Skipped),
            Err(EngineError::InvalidTransition { .. }) => Ok(Admission::Skipped),
            Err(e) => Err(e),
        }
    }
}
