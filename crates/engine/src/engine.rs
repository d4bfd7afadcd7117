//! The assembled engine: one object exposing the dashboard, executor and
//! inference surfaces, plus the periodic cycle that drives scheduling,
//! the stall watchdog, snapshots and alerting.

use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread;

use tracing::{debug, error, info, warn};

use quotaflow_core::{Clock, EngineResult, JobId, ResourceUsage, TenantId};
use quotaflow_jobs::{
    InMemoryJobStore, Job, JobCursor, JobDetail, JobExecutor, JobRegistry, JobRequest, JobScheduler,
    JobState, ProgressReport, ProgressTracker, ReportOutcome, TickReport,
};
use quotaflow_monitor::{
    Alert, AlertEngine, AlertEvent, AlertRule, AlertSink, MetricSnapshot, MetricsAggregator, RequestRecorder,
    RequestSample, RuleSpec, SystemSample,
};
use quotaflow_quota::{
    InMemoryOverageLog, OverageEvent, PolicyError, PolicyHandle, QuotaPolicy, TenantDirectory, UsageMeter, UsageReport,
};

use crate::config::{ConfigError, EngineConfig};

/// What one [`Engine::run_cycle`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub tick: TickReport,
    pub stalled: Vec<JobId>,
    /// Sequence number of the snapshot taken this cycle, if one was due.
    pub snapshot: Option<u64>,
    pub alerts: Vec<AlertEvent>,
}

/// Fans alert events out to subscribed notification sinks.
#[derive(Default)]
struct AlertFanout {
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
}

impl AlertSink for AlertFanout {
    fn deliver(&self, event: &AlertEvent) {
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            sink.deliver(event);
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    policy: Arc<PolicyHandle>,
    overages: Arc<InMemoryOverageLog>,
    registry: Arc<JobRegistry>,
    scheduler: JobScheduler,
    aggregator: MetricsAggregator,
    alerts: AlertEngine,
    alert_sinks: Arc<AlertFanout>,
}

impl Engine {
    /// Wire the engine. Reads the policy and alert rule files named in `config`.
    pub fn new(
        config: EngineConfig,
        tenants: Arc<dyn TenantDirectory>,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let policy = match &config.policy_path {
            Some(path) => QuotaPolicy::load(path)?,
            None => QuotaPolicy::default(),
        };
        let policy = Arc::new(PolicyHandle::new(policy));

        let overages = Arc::new(InMemoryOverageLog::new());
        let meter = Arc::new(
            UsageMeter::new(policy.clone(), tenants, clock.clone()).with_overage_sink(overages.clone()),
        );
        let progress = Arc::new(ProgressTracker::new(config.progress_window, clock.clone()));
        let registry = Arc::new(JobRegistry::new(
            InMemoryJobStore::arc(),
            meter,
            progress,
            clock.clone(),
        ));

        let scheduler = JobScheduler::new(registry.clone(), executor, config.scheduler_config());
        let recorder = Arc::new(RequestRecorder::new(
            config.latency_window,
            config.system_window,
            clock.clone(),
        ));
        let aggregator = MetricsAggregator::new(
            registry.clone(),
            recorder,
            clock.clone(),
            config.aggregator_config(),
        );

        let alert_sinks = Arc::new(AlertFanout::default());
        let alerts = AlertEngine::new(Vec::new(), alert_sinks.clone());
        let rules = match &config.alert_rules_path {
            Some(path) => alerts.compile(&RuleSpec::load(path)?),
            None => AlertRule::defaults(),
        };
        alerts.replace_rules(rules);

        info!(
            global_capacity = config.global_capacity,
            alert_rules = alerts.rules().len(),
            "engine initialised"
        );

        Ok(Self {
            config,
            clock,
            policy,
            overages,
            registry,
            scheduler,
            aggregator,
            alerts,
            alert_sinks,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        self.registry.meter()
    }

    // Dashboard surface

    pub fn submit(&self, request: JobRequest) -> EngineResult<Job> {
        self.registry.submit(request)
    }

    /// Stop a job. Quota is released at once; the executor is asked to cancel.
    ///
    /// `started_at` on the stopped job says whether it had been admitted, so a
    /// stop that races the scheduler still reaches the executor.
    pub fn stop(&self, job_id: JobId) -> EngineResult<Job> {
        let job = self.registry.stop(job_id)?;
        if job.started_at.is_some() {
            self.scheduler.cancel(job_id);
        }
        Ok(job)
    }

    pub fn get(&self, job_id: JobId) -> EngineResult<Job> {
        self.registry.get(job_id)
    }

    pub fn get_detail(&self, job_id: JobId) -> EngineResult<JobDetail> {
        self.registry.get_detail(job_id)
    }

    pub fn list_by_tenant(&self, tenant_id: TenantId, filter: Option<JobState>) -> JobCursor {
        self.registry.list_by_tenant(tenant_id, filter)
    }

    pub fn current_usage(&self, tenant_id: TenantId) -> EngineResult<UsageReport> {
        self.meter().current_usage(tenant_id)
    }

    pub fn latest_snapshot(&self) -> Option<Arc<MetricSnapshot>> {
        self.aggregator.latest()
    }

    pub fn snapshots(&self) -> Vec<Arc<MetricSnapshot>> {
        self.aggregator.snapshots()
    }

    pub fn downsampled_snapshots(&self) -> Vec<Arc<MetricSnapshot>> {
        self.aggregator.downsampled()
    }

    pub fn recent_alerts(&self) -> Vec<AlertEvent> {
        self.alerts.recent()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active()
    }

    pub fn overages(&self) -> Vec<OverageEvent> {
        self.overages.events()
    }

    // Executor surface

    pub fn report_progress(&self, job_id: JobId, report: ProgressReport) -> EngineResult<ReportOutcome> {
        self.registry.report_progress(job_id, report)
    }

    pub fn complete(&self, job_id: JobId, actual: ResourceUsage) -> EngineResult<Job> {
        self.registry.complete(job_id, actual)
    }

    pub fn fail(&self, job_id: JobId, error: impl Into<String>, actual: Option<ResourceUsage>) -> EngineResult<Job> {
        self.registry.fail(job_id, error, actual)
    }

    /// Append a line to the job's log (training output, ingestion notes).
    pub fn append_log(&self, job_id: JobId, message: impl Into<String>) -> EngineResult<Job> {
        self.registry.append_log(job_id, message)
    }

    // Inference surface

    pub fn record_request(&self, sample: RequestSample) {
        self.aggregator.recorder().record_request(sample);
    }

    pub fn record_system(&self, sample: SystemSample) {
        self.aggregator.recorder().record_system(sample);
    }

    // Operations

    pub fn subscribe_alerts(&self, sink: Arc<dyn AlertSink>) {
        self.alert_sinks
            .sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Swap the tier table. Jobs already admitted keep their reservations.
    pub fn reload_policy(&self, policy: QuotaPolicy) {
        self.policy.reload(policy);
        info!("quota policy reloaded");
    }

    pub fn reload_policy_from(&self, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        self.policy.reload_from_path(path)?;
        info!("quota policy reloaded from file");
        Ok(())
    }

    pub fn replace_alert_rules(&self, rules: Vec<AlertRule>) {
        self.alerts.replace_rules(rules);
    }

    /// Take a snapshot now and evaluate alerts against it.
    pub fn take_snapshot(&self) -> EngineResult<(Arc<MetricSnapshot>, Vec<AlertEvent>)> {
        let snapshot = self.aggregator.aggregate()?;
        let events = self.alerts.evaluate(&snapshot);
        Ok((snapshot, events))
    }

    /// One pass of background work. Each stage runs even if an earlier one failed.
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.scheduler.tick() {
            Ok(tick) => report.tick = tick,
            Err(e) => error!(error = %e, "scheduler tick failed"),
        }

        if let Some(timeout) = self.config.stall_timeout() {
            match self.registry.fail_stalled(timeout) {
                Ok(stalled) => report.stalled = stalled,
                Err(e) => error!(error = %e, "stall watchdog failed"),
            }
        }

        match self.aggregator.aggregate_if_due() {
            Ok(Some(snapshot)) => {
                report.snapshot = Some(snapshot.seq);
                report.alerts = self.alerts.evaluate(&snapshot);
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "metric aggregation failed"),
        }

        if !report.tick.is_empty() || !report.stalled.is_empty() {
            debug!(
                admitted = report.tick.admitted.len(),
                requeued = report.tick.requeued.len(),
                failed = report.tick.failed.len(),
                stalled = report.stalled.len(),
                "engine cycle"
            );
        }
        report
    }

    /// Run [`run_cycle`](Self::run_cycle) on a background thread every
    /// `scheduler_interval` until the handle is shut down or dropped.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<EngineHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let interval = self.config.scheduler_interval();

        let join = thread::Builder::new()
            .name("quotaflow-engine".to_string())
            .spawn(move || {
                info!("engine driver started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            self.run_cycle();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("engine driver stopped");
            })?;

        Ok(EngineHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Handle to the background driver.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl EngineHandle {
    /// Request shutdown and wait for the current cycle to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("engine driver panicked");
            }
        }
    }
}
