//! Periodic snapshot production.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use quotaflow_core::{Clock, EngineError, EngineResult};
use quotaflow_jobs::JobRegistry;

use crate::buffer::SnapshotBuffer;
use crate::recorder::RequestRecorder;
use crate::snapshot::{Diagnostics, MetricSnapshot};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub interval: Duration,
    pub snapshot_capacity: usize,
    pub downsample_factor: usize,
    pub downsampled_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            // 24h at the default interval
            snapshot_capacity: 5_760,
            downsample_factor: 20,
            downsampled_capacity: 1_440,
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    seq: u64,
    last_taken: Option<DateTime<Utc>>,
}

/// Single writer of [`MetricSnapshot`]s; any number of readers.
pub struct MetricsAggregator {
    registry: Arc<JobRegistry>,
    recorder: Arc<RequestRecorder>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    writer: Mutex<WriterState>,
    buffer: RwLock<SnapshotBuffer>,
}

impl MetricsAggregator {
    pub fn new(
        registry: Arc<JobRegistry>,
        recorder: Arc<RequestRecorder>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
    ) -> Self {
        let buffer = SnapshotBuffer::new(
            config.snapshot_capacity,
            config.downsample_factor,
            config.downsampled_capacity,
        );
        Self {
            registry,
            recorder,
            clock,
            config,
            writer: Mutex::new(WriterState::default()),
            buffer: RwLock::new(buffer),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<RequestRecorder> {
        &self.recorder
    }

    /// Take a snapshot now, regardless of the interval.
    pub fn aggregate(&self) -> EngineResult<Arc<MetricSnapshot>> {
        let mut writer = self.writer.lock().map_err(|_| EngineError::poisoned())?;
        self.take(&mut writer)
    }

    /// Take a snapshot if at least one interval has passed since the last one.
    pub fn aggregate_if_due(&self) -> EngineResult<Option<Arc<MetricSnapshot>>> {
        let mut writer = self.writer.lock().map_err(|_| EngineError::poisoned())?;
        if let Some(last) = writer.last_taken {
            let elapsed = (self.clock.now() - last).to_std().unwrap_or_default();
            if elapsed < self.config.interval {
                return Ok(None);
            }
        }
        self.take(&mut writer).map(Some)
    }

    fn take(&self, writer: &mut WriterState) -> EngineResult<Arc<MetricSnapshot>> {
        let jobs = self.registry.counts()?;
        let meter = self.registry.meter();
        let usage = meter.usage_by_tier();
        let diagnostics = Diagnostics {
            stale_progress_reports: self.registry.stale_progress_reports(),
            invalid_transitions: self.registry.invalid_transitions(),
            overage_events: meter.overage_events(),
        };
        let readout = self.recorder.drain();

        let taken_at = self.clock.now();
        writer.seq += 1;
        writer.last_taken = Some(taken_at);

        let snapshot = Arc::new(MetricSnapshot {
            seq: writer.seq,
            taken_at,
            span: 1,
            jobs,
            requests: readout.requests,
            latency: readout.latency,
            models: readout.models,
            tiers: readout.tiers,
            usage,
            system: readout.system,
            errors: readout.errors,
            diagnostics,
        });

        self.buffer
            .write()
            .map_err(|_| EngineError::poisoned())?
            .push(snapshot.clone());

        debug!(
            seq = snapshot.seq,
            requests = snapshot.requests.total,
            queued = snapshot.jobs.queued,
            running = snapshot.jobs.running,
            "metric snapshot taken"
        );
        Ok(snapshot)
    }

    pub fn latest(&self) -> Option<Arc<MetricSnapshot>> {
        self.buffer.read().ok()?.latest()
    }

    /// Native-resolution snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<Arc<MetricSnapshot>> {
        self.buffer.read().map(|b| b.native()).unwrap_or_default()
    }

    pub fn downsampled(&self) -> Vec<Arc<MetricSnapshot>> {
        self.buffer.read().map(|b| b.downsampled()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RequestSample;
    use quotaflow_core::{ManualClock, ResourceUsage, TenantId, Tier};
    use quotaflow_jobs::{InMemoryJobStore, JobKind, JobRequest, ProgressTracker};
    use quotaflow_quota::{BillingPeriod, InMemoryTenantDirectory, PolicyHandle, TenantAccount, UsageMeter};

    fn setup(config: AggregatorConfig) -> (MetricsAggregator, Arc<JobRegistry>, Arc<ManualClock>, TenantId) {
        let clock = Arc::new(ManualClock::default());
        let tenants = Arc::new(InMemoryTenantDirectory::new());
        let tenant = TenantId::new();
        tenants.upsert(TenantAccount::new(tenant, Tier::Individual, BillingPeriod::monthly(clock.now())));
        let meter = Arc::new(UsageMeter::new(Arc::new(PolicyHandle::default()), tenants, clock.clone()));
        let registry = Arc::new(JobRegistry::new(
            InMemoryJobStore::arc(),
            meter,
            Arc::new(ProgressTracker::new(12, clock.clone())),
            clock.clone(),
        ));
        let recorder = Arc::new(RequestRecorder::new(1000, 100, clock.clone()));
        let aggregator = MetricsAggregator::new(registry.clone(), recorder, clock.clone(), config);
        (aggregator, registry, clock, tenant)
    }

    #[test]
    fn snapshot_combines_jobs_usage_and_requests() {
        let (aggregator, registry, _clock, tenant) = setup(AggregatorConfig::default());
        registry
            .submit(JobRequest::new(tenant, JobKind::ingestion("contracts"), ResourceUsage::tokens(1_500)))
            .unwrap();
        aggregator
            .recorder()
            .record_request(RequestSample::new("legal-expert", Duration::from_millis(300), false).with_tier(Tier::Individual));

        let snap = aggregator.aggregate().unwrap();
        assert_eq!(snap.seq, 1);
        assert_eq!(snap.jobs.queued, 1);
        assert_eq!(snap.requests.error_rate, 100.0);
        assert_eq!(snap.value("usage.individual.tokens.reserved"), Some(1_500.0));
        assert_eq!(snap.value("usage.individual.tenants"), Some(1.0));
        assert_eq!(snap.value("tiers.individual.errors"), Some(1.0));
        assert_eq!(snap.value("errors.unknown"), Some(1.0));

        let next = aggregator.aggregate().unwrap();
        assert_eq!(next.seq, 2);
        assert_eq!(next.requests.total, 0);
        assert_eq!(aggregator.latest().unwrap().seq, 2);
    }

    #[test]
    fn respects_interval() {
        let (aggregator, _registry, clock, _tenant) = setup(AggregatorConfig {
            interval: Duration::from_secs(15),
            ..Default::default()
        });
        assert!(aggregator.aggregate_if_due().unwrap().is_some());
        clock.advance(Duration::from_secs(10));
        assert!(aggregator.aggregate_if_due().unwrap().is_none());
        clock.advance(Duration::from_secs(5));
        assert!(aggregator.aggregate_if_due().unwrap().is_some());
        assert_eq!(aggregator.snapshots().len(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let (aggregator, _registry, _clock, _tenant) = setup(AggregatorConfig {
            interval: Duration::from_secs(1),
            snapshot_capacity: 4,
            downsample_factor: 2,
            downsampled_capacity: 2,
        });
        for _ in 0..20 {
            aggregator.aggregate().unwrap();
        }
        let native = aggregator.snapshots();
        assert_eq!(native.len(), 4);
        assert_eq!(native.first().unwrap().seq, 17);
        let coarse = aggregator.downsampled();
        assert_eq!(coarse.len(), 2);
        assert_eq!(coarse.last().unwrap().seq, 16);
        assert_eq!(coarse.last().unwrap().span, 2);
    }
}
