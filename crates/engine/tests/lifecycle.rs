//! End-to-end behaviour of the assembled engine with a scripted executor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use quotaflow_core::{Clock, EngineError, JobId, ManualClock, ResourceKind, ResourceUsage, TenantId, Tier};
use quotaflow_engine::{Engine, EngineConfig};
use quotaflow_jobs::{
    ExecutorError, JobExecutor, JobKind, JobRequest, JobStart, JobState, ProgressReport, ReportOutcome,
};
use quotaflow_monitor::{InMemoryAlertSink, RequestSample};
use quotaflow_quota::{BillingPeriod, InMemoryTenantDirectory, Limit, QuotaPolicy, TenantAccount};

#[derive(Default)]
struct ScriptedExecutor {
    starts: Mutex<Vec<JobStart>>,
    cancels: Mutex<Vec<JobId>>,
    script: Mutex<VecDeque<Result<(), ExecutorError>>>,
    fallback: Mutex<Option<ExecutorError>>,
}

impl ScriptedExecutor {
    fn always_unavailable(reason: &str) -> Self {
        let executor = Self::default();
        *executor.fallback.lock().unwrap() = Some(ExecutorError::Unavailable(reason.into()));
        executor
    }

    fn started(&self) -> Vec<JobId> {
        self.starts.lock().unwrap().iter().map(|s| s.job_id).collect()
    }
}

impl JobExecutor for ScriptedExecutor {
    fn start(&self, job: &JobStart) -> Result<(), ExecutorError> {
        self.starts.lock().unwrap().push(job.clone());
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        match self.fallback.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn cancel(&self, job_id: JobId) {
        self.cancels.lock().unwrap().push(job_id);
    }
}

struct Harness {
    engine: Arc<Engine>,
    executor: Arc<ScriptedExecutor>,
    clock: Arc<ManualClock>,
    tenants: Arc<InMemoryTenantDirectory>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        Self::with_executor(config, ScriptedExecutor::default())
    }

    fn with_executor(config: EngineConfig, executor: ScriptedExecutor) -> Self {
        let clock = Arc::new(ManualClock::default());
        let tenants = Arc::new(InMemoryTenantDirectory::new());
        let executor = Arc::new(executor);
        let engine = Engine::new(config, tenants.clone(), executor.clone(), clock.clone()).unwrap();
        Self {
            engine: Arc::new(engine),
            executor,
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

    fn submit_tokens(&self, tenant: TenantId, tokens: u64) -> Result<JobId, EngineError> {
        self.engine
            .submit(JobRequest::new(tenant, JobKind::ingestion("contracts/"), ResourceUsage::tokens(tokens)))
            .map(|job| job.id)
    }

    fn tokens(&self, tenant: TenantId) -> (u64, u64) {
        let report = self.engine.current_usage(tenant).unwrap();
        let line = report.line(ResourceKind::Tokens).unwrap();
        (line.reserved, line.consumed)
    }
}

#[test]
fn job_runs_to_completion_and_settles_quota() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Individual);
    let job_id = h.submit_tokens(tenant, 1_500).unwrap();
    assert_eq!(h.tokens(tenant), (1_500, 0));

    let cycle = h.engine.run_cycle();
    assert_eq!(cycle.tick.admitted, vec![job_id]);
    assert_eq!(h.executor.started(), vec![job_id]);
    assert_eq!(h.engine.get(job_id).unwrap().state, JobState::Running);

    let outcome = h
        .engine
        .report_progress(job_id, ProgressReport::new(1, 600).with_total(1_500))
        .unwrap();
    assert!(matches!(outcome, ReportOutcome::Applied(ref p) if p.percent == Some(40.0)));

    let done = h.engine.complete(job_id, ResourceUsage::tokens(1_200)).unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(h.tokens(tenant), (0, 1_200));

    // At-least-once delivery of the terminal report.
    h.engine.complete(job_id, ResourceUsage::tokens(1_200)).unwrap();
    assert_eq!(h.tokens(tenant), (0, 1_200));
}

#[test]
fn reservation_over_the_monthly_limit_is_denied() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Individual);

    let bulk = h.submit_tokens(tenant, 49_000).unwrap();
    h.engine.run_cycle();
    h.engine.complete(bulk, ResourceUsage::tokens(49_000)).unwrap();

    let err = h.submit_tokens(tenant, 1_500).unwrap_err();
    match err {
        EngineError::QuotaExceeded(denial) => {
            assert_eq!(denial.resource, ResourceKind::Tokens);
            assert_eq!(denial.used, 49_000);
            assert_eq!(denial.requested, 1_500);
            assert_eq!(denial.limit, 50_000);
            assert_eq!(denial.would_use(), 50_500);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
    assert_eq!(h.tokens(tenant), (0, 49_000));

    h.submit_tokens(tenant, 600).unwrap();
    assert_eq!(h.tokens(tenant), (600, 49_000));
}

#[test]
fn stale_progress_keeps_the_newer_percent() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Professional);
    let job_id = h.submit_tokens(tenant, 100).unwrap();
    h.engine.run_cycle();

    h.engine
        .report_progress(job_id, ProgressReport::new(2, 40).with_total(100))
        .unwrap();
    h.clock.advance(Duration::from_secs(2));
    let stale = h
        .engine
        .report_progress(job_id, ProgressReport::new(1, 35).with_total(100))
        .unwrap();

    assert_eq!(stale, ReportOutcome::Ignored);
    let detail = h.engine.get_detail(job_id).unwrap();
    assert_eq!(detail.progress.unwrap().percent, Some(40.0));
}

#[test]
fn quiet_tenant_is_admitted_in_the_first_round() {
    let h = Harness::new(EngineConfig {
        global_capacity: 2,
        ..Default::default()
    });
    let busy = h.tenant(Tier::Enterprise);
    let quiet = h.tenant(Tier::Enterprise);

    let busy_jobs: Vec<JobId> = (0..10).map(|_| h.submit_tokens(busy, 10).unwrap()).collect();
    h.clock.advance(Duration::from_secs(1));
    let quiet_job = h.submit_tokens(quiet, 10).unwrap();

    let cycle = h.engine.run_cycle();
    assert_eq!(cycle.tick.admitted, vec![busy_jobs[0], quiet_job]);

    let queued = h
        .engine
        .list_by_tenant(busy, Some(JobState::Queued))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(queued.len(), 9);
}

#[test]
fn stop_releases_quota_and_cancels_the_executor() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Individual);
    let job_id = h.submit_tokens(tenant, 2_000).unwrap();
    h.engine.run_cycle();

    let stopped = h.engine.stop(job_id).unwrap();
    assert_eq!(stopped.state, JobState::Stopped);
    assert_eq!(h.tokens(tenant), (0, 0));
    assert_eq!(*h.executor.cancels.lock().unwrap(), vec![job_id]);

    // The executor has not noticed yet.
    let late = h
        .engine
        .report_progress(job_id, ProgressReport::new(5, 90).with_total(100))
        .unwrap();
    assert_eq!(late, ReportOutcome::Ignored);
    let late = h.engine.complete(job_id, ResourceUsage::tokens(2_000)).unwrap();
    assert_eq!(late.state, JobState::Stopped);
    assert_eq!(h.tokens(tenant), (0, 0));
}

#[test]
fn stopping_a_queued_job_does_not_touch_the_executor() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Free);
    let job_id = h.submit_tokens(tenant, 500).unwrap();

    h.engine.stop(job_id).unwrap();
    assert!(h.executor.cancels.lock().unwrap().is_empty());
    assert!(h.engine.run_cycle().tick.admitted.is_empty());
    assert_eq!(h.tokens(tenant), (0, 0));
}

#[test]
fn unavailable_executor_is_retried_then_fails() {
    let h = Harness::with_executor(
        EngineConfig::default(),
        ScriptedExecutor::always_unavailable("gpu pool offline"),
    );
    let tenant = h.tenant(Tier::Individual);
    let job_id = h.submit_tokens(tenant, 300).unwrap();

    for _ in 0..4 {
        h.engine.run_cycle();
        h.clock.advance(Duration::from_secs(120));
    }

    let job = h.engine.get(job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.start_attempts, 4);
    assert_eq!(job.last_error.as_deref(), Some("executor unavailable: gpu pool offline"));
    assert_eq!(h.executor.started().len(), 4);
    assert_eq!(h.tokens(tenant), (0, 0));
}

#[test]
fn stalled_jobs_are_failed_by_the_watchdog() {
    let h = Harness::new(EngineConfig {
        stall_timeout_secs: Some(300),
        ..Default::default()
    });
    let tenant = h.tenant(Tier::Individual);
    let job_id = h.submit_tokens(tenant, 300).unwrap();
    h.engine.run_cycle();

    h.clock.advance(Duration::from_secs(200));
    assert!(h.engine.run_cycle().stalled.is_empty());

    h.clock.advance(Duration::from_secs(200));
    let cycle = h.engine.run_cycle();
    assert_eq!(cycle.stalled, vec![job_id]);

    let job = h.engine.get(job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().starts_with("stalled"));
    assert_eq!(h.tokens(tenant), (0, 0));
}

#[test]
fn alerts_fire_once_and_resolve() {
    let h = Harness::new(EngineConfig::default());
    let sink = Arc::new(InMemoryAlertSink::new());
    h.engine.subscribe_alerts(sink.clone());

    for _ in 0..10 {
        h.engine
            .record_request(RequestSample::new("legal-expert", Duration::from_millis(3_000), false));
    }
    let cycle = h.engine.run_cycle();
    assert_eq!(cycle.snapshot, Some(1));
    let fired: Vec<&str> = cycle.alerts.iter().map(|e| e.alert().rule.as_str()).collect();
    assert_eq!(fired, vec!["high_latency", "high_error_rate"]);

    // Not due yet: no snapshot, no duplicate alerts.
    h.clock.advance(Duration::from_secs(5));
    let cycle = h.engine.run_cycle();
    assert_eq!(cycle.snapshot, None);
    assert!(cycle.alerts.is_empty());

    for _ in 0..300 {
        h.engine
            .record_request(RequestSample::new("legal-expert", Duration::from_millis(50), true));
    }
    h.clock.advance(Duration::from_secs(10));
    let cycle = h.engine.run_cycle();
    assert_eq!(cycle.snapshot, Some(2));
    assert_eq!(cycle.alerts.len(), 2);
    assert!(cycle.alerts.iter().all(|e| !e.is_fired()));

    assert_eq!(sink.events().len(), 4);
    assert_eq!(h.engine.recent_alerts().len(), 4);
    assert!(h.engine.active_alerts().is_empty());
}

#[test]
fn snapshot_history_is_bounded() {
    let h = Harness::new(EngineConfig {
        snapshot_capacity: 3,
        downsample_factor: 2,
        downsampled_capacity: 1,
        ..Default::default()
    });
    for _ in 0..10 {
        h.engine.take_snapshot().unwrap();
    }
    let native = h.engine.snapshots();
    assert_eq!(native.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![8, 9, 10]);
    assert_eq!(h.engine.downsampled_snapshots().len(), 1);
    assert_eq!(h.engine.latest_snapshot().unwrap().seq, 10);
}

#[test]
fn overage_is_recorded_for_billing() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Free);
    let job_id = h.submit_tokens(tenant, 400).unwrap();
    h.engine.run_cycle();

    let done = h.engine.complete(job_id, ResourceUsage::tokens(1_300)).unwrap();
    assert!(done.overage);
    assert_eq!(h.tokens(tenant), (0, 1_000));

    let overages = h.engine.overages();
    assert_eq!(overages.len(), 1);
    assert_eq!(overages[0].overflow, 300);
    assert_eq!(h.engine.take_snapshot().unwrap().0.diagnostics.overage_events, 1);
}

#[test]
fn policy_reload_applies_to_new_submissions() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Free);
    assert!(h.submit_tokens(tenant, 3_000).unwrap_err().is_quota_exceeded());

    let defaults = QuotaPolicy::default();
    let mut tiers = BTreeMap::new();
    for tier in Tier::ALL {
        tiers.insert(tier, defaults.limits(tier).clone());
    }
    if let Some(free) = tiers.get_mut(&Tier::Free) {
        free.monthly_tokens = Limit::Finite(5_000);
    }
    h.engine.reload_policy(QuotaPolicy::new(tiers).unwrap());

    h.submit_tokens(tenant, 3_000).unwrap();
    assert_eq!(h.tokens(tenant), (3_000, 0));
}

#[test]
fn stop_racing_admission_still_cancels_started_jobs() {
    for _ in 0..300 {
        let h = Harness::new(EngineConfig::default());
        let tenant = h.tenant(Tier::Individual);
        let job_id = h.submit_tokens(tenant, 100).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let stopper = {
            let engine = h.engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.stop(job_id)
            })
        };
        barrier.wait();
        h.engine.run_cycle();
        stopper.join().unwrap().unwrap();

        assert_eq!(h.engine.get(job_id).unwrap().state, JobState::Stopped);
        if h.executor.started().contains(&job_id) {
            assert!(h.executor.cancels.lock().unwrap().contains(&job_id));
        }
        assert_eq!(h.tokens(tenant), (0, 0));
    }
}

#[test]
fn concurrent_submits_through_the_engine_respect_the_limit() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Free);
    let threads = 32;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let engine = h.engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.submit(JobRequest::new(tenant, JobKind::ingestion("faq/"), ResourceUsage::tokens(300)))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(EngineError::is_quota_exceeded));
    // 1_000 / 300 = 3 submissions fit.
    assert_eq!(granted, 3);
    assert_eq!(h.tokens(tenant), (900, 0));
    assert_eq!(h.engine.list_by_tenant(tenant, None).count(), granted);
}

#[test]
fn failed_requests_are_summarised_by_kind() {
    let h = Harness::new(EngineConfig::default());
    h.engine.record_request(
        RequestSample::new("legal-expert", Duration::from_millis(900), true).with_error("timeout", "no answer"),
    );
    h.engine.record_request(RequestSample::new("legal-expert", Duration::from_millis(40), true));

    h.engine.run_cycle();
    let snap = h.engine.latest_snapshot().unwrap();
    assert_eq!(snap.requests.errors, 1);
    assert_eq!(snap.value("errors.timeout"), Some(1.0));
    assert_eq!(snap.errors.recent.len(), 1);
    assert_eq!(snap.errors.recent[0].message, "no answer");
    assert_eq!(snap.errors.recent[0].at, h.clock.now());
}

#[test]
fn job_log_is_part_of_the_detail_view() {
    let h = Harness::new(EngineConfig::default());
    let tenant = h.tenant(Tier::Individual);
    let job_id = h.submit_tokens(tenant, 100).unwrap();
    h.engine.run_cycle();
    h.engine.append_log(job_id, "loaded 120 documents").unwrap();
    h.engine.complete(job_id, ResourceUsage::tokens(80)).unwrap();

    let detail = h.engine.get_detail(job_id).unwrap();
    let lines: Vec<&str> = detail.job.log.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(
        lines,
        ["submitted", "queued -> running", "loaded 120 documents", "running -> completed"]
    );
}

#[derive(Debug, Clone)]
enum Outcome {
    Complete(u64),
    Fail(Option<u64>),
    Stop,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        (0u64..1_500).prop_map(Outcome::Complete),
        proptest::option::of(0u64..600).prop_map(Outcome::Fail),
        Just(Outcome::Stop),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn usage_never_exceeds_the_tier_limit(
        jobs in proptest::collection::vec((1u64..700, outcome()), 1..30),
    ) {
        let h = Harness::new(EngineConfig::default());
        let tenant = h.tenant(Tier::Free);

        for (tokens, outcome) in jobs {
            let Ok(job_id) = h.submit_tokens(tenant, tokens) else {
                continue;
            };
            h.engine.run_cycle();
            let _ = match outcome {
                Outcome::Complete(actual) => h.engine.complete(job_id, ResourceUsage::tokens(actual)),
                Outcome::Fail(actual) => h.engine.fail(job_id, "boom", actual.map(ResourceUsage::tokens)),
                Outcome::Stop => h.engine.stop(job_id),
            };
            let (reserved, consumed) = h.tokens(tenant);
            prop_assert!(reserved + consumed <= 1_000);
        }
    }
}
