//! Job registry: the single owner of job state.
//!
//! Every mutation goes through one load / validate /
//! compare-and-swap loop against the store. Quota side effects (finalize or
//! release) run only after the terminal write has landed, and the meter makes
//! them idempotent, so duplicate terminal callbacks never settle twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use quotaflow_core::{Clock, EngineError, EngineResult, ExpectedVersion, JobId, ResourceUsage, TenantId};
use quotaflow_quota::UsageMeter;

use crate::progress::{ProgressReport, ProgressSnapshot, ProgressTracker};
use crate::store::{JobCounts, JobStore, JobStoreError, ListPosition};
use crate::types::{Job, JobKind, JobState, Step, TransitionInfo};

/// Attempts at resolving a version conflict before giving up.
const MAX_CAS_ATTEMPTS: usize = 16;

const PAGE_SIZE: usize = 64;

/// A submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub estimate: ResourceUsage,
    #[serde(default)]
    pub priority: i32,
}

impl JobRequest {
    pub fn new(tenant_id: TenantId, kind: JobKind, estimate: ResourceUsage) -> Self {
        Self {
            tenant_id,
            kind,
            estimate,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A job together with its latest progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: Job,
    pub progress: Option<ProgressSnapshot>,
}

/// What happened to a progress report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Applied(ProgressSnapshot),
    /// Out of order, duplicate, or for a job that is no longer running.
    Ignored,
}

/// Result of one pass of the update loop.
enum Change {
    Save(Job),
    Unchanged,
}

pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    meter: Arc<UsageMeter>,
    progress: Arc<ProgressTracker>,
    clock: Arc<dyn Clock>,
    invalid_transitions: AtomicU64,
}

impl JobRegistry {
    pub fn new(
        store: Arc<dyn JobStore>,
        meter: Arc<UsageMeter>,
        progress: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            meter,
            progress,
            clock,
            invalid_transitions: AtomicU64::new(0),
        }
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Rejected transition attempts since startup.
    pub fn invalid_transitions(&self) -> u64 {
        self.invalid_transitions.load(Ordering::Relaxed)
    }

    /// Progress reports dropped as stale since startup.
    pub fn stale_progress_reports(&self) -> u64 {
        self.progress.stale_reports()
    }

    /// Reserve quota and create a queued job.
    ///
    /// On any failure nothing is created and no quota stays reserved.
    pub fn submit(&self, request: JobRequest) -> EngineResult<Job> {
        let JobRequest {
            tenant_id,
            kind,
            estimate,
            priority,
        } = request;

        match &kind {
            JobKind::Training { model_name } if model_name.trim().is_empty() => {
                return Err(EngineError::validation("model name must not be empty"));
            }
            JobKind::Ingestion { source } if source.trim().is_empty() => {
                return Err(EngineError::validation("ingestion source must not be empty"));
            }
            _ => {}
        }

        if kind.is_training() {
            let in_use = self.models_in_use(tenant_id)?;
            self.meter.check_model_slot(tenant_id, in_use)?;
        }

        let reservation = self.meter.reserve(tenant_id, &estimate)?;
        let job = Job::new(tenant_id, kind, estimate, reservation.id, self.clock.now()).with_priority(priority);

        if let Err(e) = self.store.insert(job.clone()) {
            error!(tenant_id = %tenant_id, error = %e, "failed to store job; releasing reservation");
            if let Err(release_err) = self.meter.release(tenant_id, reservation.id) {
                error!(reservation_id = %reservation.id, error = %release_err, "failed to release reservation");
            }
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            tenant_id = %tenant_id,
            kind = job.kind.type_name(),
            priority,
            "job submitted"
        );
        Ok(job)
    }

    /// Training jobs that occupy a model slot.
    fn models_in_use(&self, tenant_id: TenantId) -> EngineResult<u64> {
        let mut in_use = 0;
        for job in self.list_by_tenant(tenant_id, None) {
            let job = job?;
            if job.kind.is_training()
                && matches!(job.state, JobState::Queued | JobState::Running | JobState::Completed)
            {
                in_use += 1;
            }
        }
        Ok(in_use)
    }

    /// Load / validate / compare-and-swap until the change lands or is refused.
    ///
    /// Returns the stored job and whether this call changed it.
    fn update<F>(&self, job_id: JobId, mut change: F) -> EngineResult<(Job, bool)>
    where
        F: FnMut(&Job) -> EngineResult<Change>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(job_id)?;
            let next = match change(&current)? {
                Change::Save(next) => next,
                Change::Unchanged => return Ok((current, false)),
            };
            match self.store.save(&next, ExpectedVersion::Exact(current.version)) {
                Ok(saved) => return Ok((saved, true)),
                Err(JobStoreError::VersionConflict { .. }) => {
                    debug!(job_id = %job_id, "version conflict; retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::conflict(format!(
            "job {job_id} kept changing; gave up after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Move a job along the state table.
    ///
    /// Repeating the current terminal state is a no-op that returns the job.
    /// Entering `completed` or `failed` settles the reservation against the
    /// actual usage; entering `stopped` releases it.
    pub fn transition(&self, job_id: JobId, target: JobState, info: TransitionInfo) -> EngineResult<Job> {
        self.apply(job_id, target, info, false)
    }

    /// Shared body of [`Self::transition`] and executor outcomes.
    ///
    /// With `outcome` set, finding the job already `stopped` inside the CAS
    /// loop makes the call stale rather than invalid.
    fn apply(&self, job_id: JobId, target: JobState, info: TransitionInfo, outcome: bool) -> EngineResult<Job> {
        let now = self.clock.now();
        let mut stale = false;
        let result = self.update(job_id, |current| {
            stale = outcome && current.state == JobState::Stopped && target != JobState::Stopped;
            if stale {
                return Ok(Change::Unchanged);
            }
            match current.state.step_to(target) {
                Step::Apply => {
                    let mut next = current.clone();
                    next.enter(target, &info, now);
                    Ok(Change::Save(next))
                }
                Step::AlreadyThere => Ok(Change::Unchanged),
                Step::Invalid => Err(EngineError::invalid_transition(job_id, current.state, target)),
            }
        });

        let (job, changed) = match result {
            Ok(ok) => ok,
            Err(e @ EngineError::InvalidTransition { .. }) => {
                self.invalid_transitions.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job_id, error = %e, "transition rejected");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if stale {
            self.progress.note_stale();
            debug!(job_id = %job_id, outcome = %target, "outcome for stopped job; ignored");
            return Ok(job);
        }

        if changed {
            info!(job_id = %job_id, tenant_id = %job.tenant_id, state = %job.state, "job transitioned");
            if target == JobState::Running && job.start_attempts > 1 {
                self.progress.reset(job_id);
            }
            if job.state.is_terminal() {
                self.progress.close(job_id);
            }
        }

        if job.state.is_terminal() {
            self.settle(job)
        } else {
            Ok(job)
        }
    }

    /// Settle a terminal job's reservation and mark the job settled.
    ///
    /// Safe to call more than once: the meter returns the first settlement
    /// while the job is not yet marked, and a marked job is left alone.
    fn settle(&self, job: Job) -> EngineResult<Job> {
        if job.settled {
            return Ok(job);
        }
        let settlement = match (job.state, &job.actual) {
            (JobState::Completed, actual) => {
                let actual = actual.as_ref().unwrap_or(&job.estimate);
                self.meter.finalize(job.tenant_id, job.reservation_id, actual)?
            }
            (JobState::Failed, Some(actual)) => self.meter.finalize(job.tenant_id, job.reservation_id, actual)?,
            (JobState::Failed, None) | (JobState::Stopped, _) => {
                self.meter.release(job.tenant_id, job.reservation_id)?
            }
            _ => return Ok(job),
        };

        let overage = settlement.has_overage();
        let now = self.clock.now();
        let (job, changed) = self.update(job.id, |current| {
            if current.settled {
                return Ok(Change::Unchanged);
            }
            let mut next = current.clone();
            next.settled = true;
            if overage {
                next.overage = true;
                next.log("usage exceeded quota; overage recorded", now);
            }
            Ok(Change::Save(next))
        })?;
        if changed && overage {
            warn!(job_id = %job.id, tenant_id = %job.tenant_id, "job usage exceeded quota; overage recorded");
        }
        Ok(job)
    }

    /// Scheduler-only `running → queued` edge after a failed executor start.
    pub(crate) fn requeue(&self, job_id: JobId, error: String, not_before: DateTime<Utc>) -> EngineResult<Job> {
        let now = self.clock.now();
        let (job, _) = self.update(job_id, |current| {
            if current.state != JobState::Running {
                return Err(EngineError::invalid_transition(job_id, current.state, JobState::Queued));
            }
            let mut next = current.clone();
            next.requeue(error.clone(), not_before, now);
            Ok(Change::Save(next))
        })?;
        info!(job_id = %job_id, attempts = job.start_attempts, not_before = %not_before, "job requeued after failed start");
        Ok(job)
    }

    /// Executor callback: the job finished.
    pub fn complete(&self, job_id: JobId, actual: ResourceUsage) -> EngineResult<Job> {
        self.finish(job_id, JobState::Completed, TransitionInfo::completed(actual))
    }

    /// Executor callback: the job failed, optionally after using some quota.
    pub fn fail(&self, job_id: JobId, error: impl Into<String>, actual: Option<ResourceUsage>) -> EngineResult<Job> {
        self.finish(job_id, JobState::Failed, TransitionInfo::failed(error, actual))
    }

    /// An outcome for a job that was stopped first is stale, not an error.
    fn finish(&self, job_id: JobId, target: JobState, info: TransitionInfo) -> EngineResult<Job> {
        self.apply(job_id, target, info, true)
    }

    pub fn stop(&self, job_id: JobId) -> EngineResult<Job> {
        self.transition(job_id, JobState::Stopped, TransitionInfo::none())
    }

    /// Append an executor-supplied line to the job log.
    pub fn append_log(&self, job_id: JobId, message: impl Into<String>) -> EngineResult<Job> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(EngineError::validation("log message must not be empty"));
        }
        let now = self.clock.now();
        let (job, _) = self.update(job_id, |current| {
            let mut next = current.clone();
            next.log(message.clone(), now);
            Ok(Change::Save(next))
        })?;
        Ok(job)
    }

    pub fn get(&self, job_id: JobId) -> EngineResult<Job> {
        self.store.load(job_id)?.ok_or(EngineError::JobNotFound(job_id))
    }

    pub fn get_detail(&self, job_id: JobId) -> EngineResult<JobDetail> {
        let job = self.get(job_id)?;
        Ok(JobDetail {
            progress: self.progress.get(job_id),
            job,
        })
    }

    /// Restartable listing of a tenant's jobs in creation order.
    pub fn list_by_tenant(&self, tenant_id: TenantId, filter: Option<JobState>) -> JobCursor {
        self.list_by_tenant_after(tenant_id, filter, None)
    }

    /// Resume a listing after a position from [`JobCursor::position`].
    pub fn list_by_tenant_after(
        &self,
        tenant_id: TenantId,
        filter: Option<JobState>,
        after: Option<ListPosition>,
    ) -> JobCursor {
        JobCursor {
            store: self.store.clone(),
            tenant_id,
            filter,
            position: after,
            fetched: after,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Jobs currently in `state`, in creation order.
    pub fn jobs_in_state(&self, state: JobState) -> EngineResult<Vec<Job>> {
        Ok(self.store.list_by_state(state)?)
    }

    pub fn counts(&self) -> EngineResult<JobCounts> {
        Ok(self.store.counts()?)
    }

    /// Apply a progress report from the executor.
    ///
    /// Stale reports, and reports for jobs that are not running, are counted
    /// and ignored rather than failing the caller.
    pub fn report_progress(&self, job_id: JobId, report: ProgressReport) -> EngineResult<ReportOutcome> {
        let job = self.get(job_id)?;
        if job.state != JobState::Running {
            self.progress.note_stale();
            debug!(job_id = %job_id, state = %job.state, "progress for job that is not running; ignored");
            return Ok(ReportOutcome::Ignored);
        }
        match self.progress.report(job_id, report) {
            Ok(snapshot) => Ok(ReportOutcome::Applied(snapshot)),
            Err(EngineError::StaleProgressReport { .. }) => Ok(ReportOutcome::Ignored),
            Err(e) => Err(e),
        }
    }

    /// Fail running jobs that have not reported progress within `timeout`.
    pub fn fail_stalled(&self, timeout: Duration) -> EngineResult<Vec<JobId>> {
        let now = self.clock.now();
        let mut failed = Vec::new();

        for job in self.jobs_in_state(JobState::Running)? {
            let last_activity = self
                .progress
                .get(job.id)
                .map(|p| p.last_updated_at)
                .or(job.started_at)
                .unwrap_or(job.updated_at);
            if now - last_activity <= timeout {
                continue;
            }
            let reason = format!("stalled: no progress for {}s", (now - last_activity).num_seconds());
            match self.fail(job.id, reason, None) {
                Ok(failed_job) if failed_job.state == JobState::Failed => {
                    warn!(job_id = %job.id, tenant_id = %job.tenant_id, "stalled job failed");
                    failed.push(job.id);
                }
                // Finished or stopped in the meantime.
                Ok(_) | Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }
}

/// Paging iterator over a tenant's jobs.
///
/// Pages are fetched lazily; [`JobCursor::position`] can be handed back to
/// [`JobRegistry::list_by_tenant_after`] to resume a listing later.
pub struct JobCursor {
    store: Arc<dyn JobStore>,
    tenant_id: TenantId,
    filter: Option<JobState>,
    position: Option<ListPosition>,
    fetched: Option<ListPosition>,
    buffer: VecDeque<Job>,
    exhausted: bool,
}

impl JobCursor {
    /// Position of the last job this cursor examined.
    pub fn position(&self) -> Option<ListPosition> {
        self.position
    }
}

impl Iterator for JobCursor {
    type Item = EngineResult<Job>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(job) = self.buffer.pop_front() {
                self.position = Some(ListPosition::of(&job));
                if self.filter.is_none_or(|state| job.state == state) {
                    return Some(Ok(job));
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            match self.store.page_by_tenant(self.tenant_id, self.fetched, PAGE_SIZE) {
                Ok(page) => {
                    if page.len() < PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.fetched = Some(ListPosition::of(last));
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use quotaflow_core::{ManualClock, ResourceKind, Tier};
    use quotaflow_quota::{BillingPeriod, InMemoryTenantDirectory, PolicyHandle, TenantAccount};

    use crate::store::InMemoryJobStore;

    struct Fixture {
        registry: Arc<JobRegistry>,
        clock: Arc<ManualClock>,
        tenants: Arc<InMemoryTenantDirectory>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            let tenants = Arc::new(InMemoryTenantDirectory::new());
            let meter = Arc::new(UsageMeter::new(
                Arc::new(PolicyHandle::default()),
                tenants.clone(),
                clock.clone(),
            ));
            let progress = Arc::new(ProgressTracker::new(12, clock.clone()));
            let registry = Arc::new(JobRegistry::new(
                InMemoryJobStore::arc(),
                meter,
                progress,
                clock.clone(),
            ));
            Self {
                registry,
                clock,
                tenants,
            }
        }

        fn tenant(&self, tier: Tier) -> TenantId {
            let id = TenantId::new();
            self.tenants
                .upsert(TenantAccount::new(id, tier, BillingPeriod::monthly(self.clock.now())));
            id
        }

        fn running_job(&self, tenant: TenantId, estimate: ResourceUsage) -> Job {
            let job = self
                .registry
                .submit(JobRequest::new(tenant, JobKind::ingestion("docs"), estimate))
                .unwrap();
            self.registry
                .transition(job.id, JobState::Running, TransitionInfo::none())
                .unwrap()
        }

        fn tokens(&self, tenant: TenantId) -> (u64, u64) {
            let report = self.registry.meter().current_usage(tenant).unwrap();
            let line = report.line(ResourceKind::Tokens).unwrap();
            (line.reserved, line.consumed)
        }
    }

    #[test]
    fn submit_reserves_and_queues() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);

        let job = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::training("legal-expert"), ResourceUsage::tokens(1_500)))
            .unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(fx.tokens(tenant), (1_500, 0));
        assert_eq!(fx.registry.get(job.id).unwrap(), job);
    }

    #[test]
    fn denied_submit_creates_nothing() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Free);

        let err = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::ingestion("docs"), ResourceUsage::tokens(5_000)))
            .unwrap_err();

        assert!(err.is_quota_exceeded());
        assert_eq!(fx.registry.list_by_tenant(tenant, None).count(), 0);
        assert_eq!(fx.registry.counts().unwrap().total(), 0);
    }

    #[test]
    fn model_limit_blocks_extra_training_jobs() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Free);

        let first = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::training("a"), ResourceUsage::new()))
            .unwrap();
        let err = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::training("b"), ResourceUsage::new()))
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelLimitReached { in_use: 1, limit: 1 }));

        // Ingestion does not take a model slot, and a stopped run frees one.
        fx.registry
            .submit(JobRequest::new(tenant, JobKind::ingestion("docs"), ResourceUsage::new()))
            .unwrap();
        fx.registry.stop(first.id).unwrap();
        fx.registry
            .submit(JobRequest::new(tenant, JobKind::training("b"), ResourceUsage::new()))
            .unwrap();
    }

    #[test]
    fn blank_kind_is_rejected() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Free);
        let err = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::training("  "), ResourceUsage::new()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn completion_settles_actual_usage() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(1_000));

        let done = fx.registry.complete(job.id, ResourceUsage::tokens(700)).unwrap();

        assert_eq!(done.state, JobState::Completed);
        assert!(done.ended_at.is_some());
        assert_eq!(fx.tokens(tenant), (0, 700));
    }

    #[test]
    fn completion_without_actual_charges_estimate() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(300));

        fx.registry
            .transition(job.id, JobState::Completed, TransitionInfo::none())
            .unwrap();
        assert_eq!(fx.tokens(tenant), (0, 300));
    }

    #[test]
    fn stop_releases_reservation() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::ingestion("docs"), ResourceUsage::tokens(400)))
            .unwrap();

        let stopped = fx.registry.stop(job.id).unwrap();
        assert_eq!(stopped.state, JobState::Stopped);
        assert_eq!(fx.tokens(tenant), (0, 0));
    }

    #[test]
    fn duplicate_terminal_callbacks_are_idempotent() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(1_000));

        let first = fx.registry.complete(job.id, ResourceUsage::tokens(600)).unwrap();
        let second = fx.registry.complete(job.id, ResourceUsage::tokens(900)).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.actual, Some(ResourceUsage::tokens(600)));
        assert_eq!(fx.tokens(tenant), (0, 600));
        assert_eq!(fx.registry.invalid_transitions(), 0);
    }

    #[test]
    fn invalid_transitions_are_counted() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(10));
        fx.registry.complete(job.id, ResourceUsage::tokens(10)).unwrap();

        let err = fx.registry.stop(job.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let queued = fx
            .registry
            .submit(JobRequest::new(tenant, JobKind::ingestion("docs"), ResourceUsage::new()))
            .unwrap();
        assert!(fx.registry.complete(queued.id, ResourceUsage::new()).is_err());
        assert_eq!(fx.registry.invalid_transitions(), 2);
    }

    #[test]
    fn outcome_after_stop_is_stale() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(300));
        fx.registry.stop(job.id).unwrap();

        let late = fx.registry.complete(job.id, ResourceUsage::tokens(300)).unwrap();
        assert_eq!(late.state, JobState::Stopped);
        let late = fx.registry.fail(job.id, "killed", None).unwrap();
        assert_eq!(late.state, JobState::Stopped);

        assert_eq!(fx.tokens(tenant), (0, 0));
        assert_eq!(fx.registry.invalid_transitions(), 0);
        assert_eq!(fx.registry.stale_progress_reports(), 2);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let fx = Fixture::new();
        let id = JobId::new();
        assert_eq!(fx.registry.get(id), Err(EngineError::JobNotFound(id)));
        assert!(matches!(fx.registry.stop(id), Err(EngineError::JobNotFound(_))));
    }

    #[test]
    fn overage_is_flagged_on_the_job() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Free);
        let job = fx.running_job(tenant, ResourceUsage::tokens(500));

        let done = fx.registry.complete(job.id, ResourceUsage::tokens(1_400)).unwrap();

        assert!(done.overage);
        assert_eq!(fx.tokens(tenant), (0, 1_000));
        assert_eq!(fx.registry.meter().overage_events(), 1);
    }

    #[test]
    fn racing_terminal_transitions_have_one_winner() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Professional);
        let job = fx.running_job(tenant, ResourceUsage::tokens(1_000));

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let registry = fx.registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    match i % 3 {
                        0 => registry.complete(job.id, ResourceUsage::tokens(800)),
                        1 => registry.fail(job.id, "boom", Some(ResourceUsage::tokens(200))),
                        _ => registry.stop(job.id),
                    }
                })
            })
            .collect();
        let results: Vec<EngineResult<Job>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let stored = fx.registry.get(job.id).unwrap();
        assert!(stored.state.is_terminal());
        for result in &results {
            match result {
                Ok(job) => assert_eq!(job.state, stored.state),
                Err(e) => assert!(matches!(e, EngineError::InvalidTransition { .. })),
            }
        }

        let expected = match stored.state {
            JobState::Completed => (0, 800),
            JobState::Failed => (0, 200),
            _ => (0, 0),
        };
        assert_eq!(fx.tokens(tenant), expected);
    }

    #[test]
    fn progress_is_ignored_unless_running() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::new());

        let outcome = fx
            .registry
            .report_progress(job.id, ProgressReport::new(1, 40).with_total(100))
            .unwrap();
        assert!(matches!(outcome, ReportOutcome::Applied(ref s) if s.percent == Some(40.0)));

        fx.clock.advance(std::time::Duration::from_secs(2));
        let stale = fx
            .registry
            .report_progress(job.id, ProgressReport::new(0, 35).with_total(100))
            .unwrap();
        assert_eq!(stale, ReportOutcome::Ignored);
        assert_eq!(
            fx.registry.get_detail(job.id).unwrap().progress.unwrap().percent,
            Some(40.0)
        );

        fx.registry.complete(job.id, ResourceUsage::new()).unwrap();
        let late = fx
            .registry
            .report_progress(job.id, ProgressReport::new(2, 90).with_total(100))
            .unwrap();
        assert_eq!(late, ReportOutcome::Ignored);
        assert_eq!(fx.registry.stale_progress_reports(), 2);
    }

    #[test]
    fn cursor_pages_filters_and_resumes() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Enterprise);
        let mut ids = Vec::new();
        for _ in 0..150 {
            let job = fx
                .registry
                .submit(JobRequest::new(tenant, JobKind::ingestion("docs"), ResourceUsage::tokens(1)))
                .unwrap();
            ids.push(job.id);
            fx.clock.advance(std::time::Duration::from_millis(10));
        }
        for id in ids.iter().step_by(2) {
            fx.registry.stop(*id).unwrap();
        }

        let all: Vec<JobId> = fx
            .registry
            .list_by_tenant(tenant, None)
            .map(|j| j.unwrap().id)
            .collect();
        assert_eq!(all, ids);

        let mut cursor = fx.registry.list_by_tenant(tenant, Some(JobState::Queued));
        let first: Vec<JobId> = cursor.by_ref().take(10).map(|j| j.unwrap().id).collect();
        assert_eq!(first, ids.iter().skip(1).step_by(2).take(10).copied().collect::<Vec<_>>());

        let rest: Vec<JobId> = fx
            .registry
            .list_by_tenant_after(tenant, Some(JobState::Queued), cursor.position())
            .map(|j| j.unwrap().id)
            .collect();
        assert_eq!(rest.len(), 65);
        assert_eq!(rest[0], ids[21]);
    }

    #[test]
    fn stalled_jobs_are_failed_and_released() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let quiet = fx.running_job(tenant, ResourceUsage::tokens(100));
        let chatty = fx.running_job(tenant, ResourceUsage::tokens(100));

        fx.clock.advance(std::time::Duration::from_secs(600));
        fx.registry
            .report_progress(chatty.id, ProgressReport::new(1, 5))
            .unwrap();
        fx.clock.advance(std::time::Duration::from_secs(60));

        let failed = fx.registry.fail_stalled(Duration::seconds(300)).unwrap();
        assert_eq!(failed, vec![quiet.id]);

        let quiet = fx.registry.get(quiet.id).unwrap();
        assert_eq!(quiet.state, JobState::Failed);
        assert_eq!(quiet.last_error.as_deref(), Some("stalled: no progress for 660s"));
        assert_eq!(fx.tokens(tenant), (100, 0));
    }

    #[test]
    fn concurrent_submits_never_over_admit() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let threads = 64;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = fx.registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.submit(JobRequest::new(
                        tenant,
                        JobKind::ingestion("docs"),
                        ResourceUsage::tokens(1_500),
                    ))
                })
            })
            .collect();
        let results: Vec<EngineResult<Job>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|j| j.state == JobState::Queued)
            || r.as_ref().is_err_and(|e| e.is_quota_exceeded())));
        // 50_000 / 1_500 = 33 submissions fit.
        assert_eq!(granted, 33);
        assert_eq!(fx.tokens(tenant), (33 * 1_500, 0));
        assert_eq!(fx.registry.list_by_tenant(tenant, None).count(), granted);
    }

    #[test]
    fn completion_racing_stop_is_stale_not_invalid() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Enterprise);

        for _ in 0..200 {
            let job = fx.running_job(tenant, ResourceUsage::tokens(100));
            let barrier = Arc::new(Barrier::new(2));
            let stopper = {
                let registry = fx.registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.stop(job.id)
                })
            };
            barrier.wait();
            let completed = fx.registry.complete(job.id, ResourceUsage::tokens(100));
            let stopped = stopper.join().unwrap();

            let stored = fx.registry.get(job.id).unwrap();
            let completed = completed.unwrap();
            assert_eq!(completed.state, stored.state);
            match stored.state {
                JobState::Stopped => assert!(stopped.is_ok()),
                JobState::Completed => {
                    assert!(matches!(stopped, Err(EngineError::InvalidTransition { .. })))
                }
                other => panic!("unexpected state {other}"),
            }
        }
        assert_eq!(fx.tokens(tenant).0, 0);
    }

    #[test]
    fn terminal_job_is_settled_and_progress_frozen() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(100));
        fx.registry
            .report_progress(job.id, ProgressReport::new(1, 60).with_total(100))
            .unwrap();

        let done = fx.registry.complete(job.id, ResourceUsage::tokens(90)).unwrap();

        assert!(done.settled);
        assert_eq!(fx.registry.progress().live(), 0);
        let detail = fx.registry.get_detail(job.id).unwrap();
        assert_eq!(detail.progress.map(|p| p.percent), Some(Some(60.0)));

        // A repeated callback settles nothing twice.
        fx.registry.complete(job.id, ResourceUsage::tokens(90)).unwrap();
        assert_eq!(fx.tokens(tenant), (0, 90));
    }

    #[test]
    fn job_log_records_lifecycle_and_executor_lines() {
        let fx = Fixture::new();
        let tenant = fx.tenant(Tier::Individual);
        let job = fx.running_job(tenant, ResourceUsage::tokens(100));

        fx.registry.append_log(job.id, "epoch 1/3 done").unwrap();
        fx.registry.fail(job.id, "out of memory", None).unwrap();
        assert!(matches!(
            fx.registry.append_log(job.id, "  "),
            Err(EngineError::Validation(_))
        ));

        let detail = fx.registry.get_detail(job.id).unwrap();
        let lines: Vec<&str> = detail.job.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            lines,
            [
                "submitted",
                "queued -> running",
                "epoch 1/3 done",
                "running -> failed: out of memory",
            ]
        );
    }
}
