//! Live progress for running jobs.
//!
//! Executors report progress at-least-once and possibly out of order, so each
//! report carries a sequence number; anything not newer than the last applied
//! report is rejected. Throughput is smoothed with an exponentially weighted
//! moving average, which keeps the ETA from jumping around on bursty reports.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quotaflow_core::{Clock, EngineError, EngineResult, JobId};

/// One report from an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub seq: u64,
    pub units_processed: u64,
    /// Unknown for indeterminate work.
    pub units_total: Option<u64>,
    /// Free-form executor metrics (loss, accuracy, documents, ...).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ProgressReport {
    pub fn new(seq: u64, units_processed: u64) -> Self {
        Self {
            seq,
            units_processed,
            units_total: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_total(mut self, units_total: u64) -> Self {
        self.units_total = Some(units_total);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Latest derived view of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub seq: u64,
    /// 0-100; `None` while the total is unknown.
    pub percent: Option<f64>,
    pub units_processed: u64,
    pub units_total: Option<u64>,
    pub units_per_second: Option<f64>,
    pub eta_seconds: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RateEstimator {
    alpha: f64,
    rate: Option<f64>,
    last: Option<(DateTime<Utc>, u64)>,
}

impl RateEstimator {
    /// Smoothing equivalent to an `window`-sample moving average.
    fn new(window: usize) -> Self {
        Self {
            alpha: 2.0 / (window.max(1) as f64 + 1.0),
            rate: None,
            last: None,
        }
    }

    fn observe(&mut self, at: DateTime<Utc>, units: u64) {
        let Some((prev_at, prev_units)) = self.last else {
            self.last = Some((at, units));
            return;
        };
        let elapsed = (at - prev_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            // Fold same-instant reports into the next interval.
            return;
        }
        let instant = units.saturating_sub(prev_units) as f64 / elapsed;
        self.rate = Some(match self.rate {
            Some(rate) => self.alpha * instant + (1.0 - self.alpha) * rate,
            None => instant,
        });
        self.last = Some((at, units));
    }
}

#[derive(Debug)]
struct ProgressEntry {
    snapshot: Option<ProgressSnapshot>,
    estimator: RateEstimator,
}

/// Finished jobs whose last snapshot stays readable after they end.
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

/// Last snapshots of closed jobs, oldest evicted first.
#[derive(Debug, Default)]
struct Finished {
    snapshots: HashMap<JobId, Option<ProgressSnapshot>>,
    order: VecDeque<JobId>,
}

/// Per-job progress with sequence ordering and EWMA-based ETA.
///
/// Live state is kept only while a job runs; [`ProgressTracker::close`]
/// freezes the last snapshot into a bounded history.
pub struct ProgressTracker {
    window: usize,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<JobId, Arc<Mutex<ProgressEntry>>>>,
    finished: Mutex<Finished>,
    finished_retention: usize,
    stale_reports: AtomicU64,
}

impl ProgressTracker {
    pub fn new(window: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            entries: RwLock::new(HashMap::new()),
            finished: Mutex::new(Finished::default()),
            finished_retention: DEFAULT_FINISHED_RETENTION,
            stale_reports: AtomicU64::new(0),
        }
    }

    /// How many closed jobs keep their last snapshot (at least one).
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention.max(1);
        self
    }

    /// Live entry for `job_id`; a closed job gets no new entry.
    fn entry(&self, job_id: JobId, seq: u64) -> EngineResult<Arc<Mutex<ProgressEntry>>> {
        {
            let entries = self.entries.read().map_err(|_| EngineError::poisoned())?;
            if let Some(entry) = entries.get(&job_id) {
                return Ok(entry.clone());
            }
        }
        let mut entries = self.entries.write().map_err(|_| EngineError::poisoned())?;
        let finished = self.finished.lock().map_err(|_| EngineError::poisoned())?;
        if let Some(last) = finished.snapshots.get(&job_id) {
            let last_seq = last.as_ref().map_or(0, |s| s.seq);
            self.stale_reports.fetch_add(1, Ordering::Relaxed);
            debug!(job_id = %job_id, seq, "progress report for closed job");
            return Err(EngineError::StaleProgressReport { job_id, last_seq, seq });
        }
        drop(finished);
        Ok(entries
            .entry(job_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ProgressEntry {
                    snapshot: None,
                    estimator: RateEstimator::new(self.window),
                }))
            })
            .clone())
    }

    /// Apply a report if it is newer than the last applied one.
    ///
    /// Percent never decreases for a job, and `last_updated_at` strictly
    /// advances with every accepted report.
    pub fn report(&self, job_id: JobId, report: ProgressReport) -> EngineResult<ProgressSnapshot> {
        let entry = self.entry(job_id, report.seq)?;
        let mut entry = entry.lock().map_err(|_| EngineError::poisoned())?;
        if let Some(prev) = &entry.snapshot
            && report.seq <= prev.seq
        {
            let last_seq = prev.seq;
            self.stale_reports.fetch_add(1, Ordering::Relaxed);
            debug!(job_id = %job_id, seq = report.seq, last_seq, "stale progress report");
            return Err(EngineError::StaleProgressReport {
                job_id,
                last_seq,
                seq: report.seq,
            });
        }

        let prev = entry.snapshot.take();
        let now = self.clock.now();
        let last_updated_at = match &prev {
            Some(prev) if now <= prev.last_updated_at => prev.last_updated_at + Duration::milliseconds(1),
            _ => now,
        };

        let units_processed = prev
            .as_ref()
            .map_or(report.units_processed, |p| p.units_processed.max(report.units_processed));
        let units_total = report
            .units_total
            .or_else(|| prev.as_ref().and_then(|p| p.units_total));

        entry.estimator.observe(now, units_processed);
        let rate = entry.estimator.rate;

        let mut percent = units_total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (units_processed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            }
        });
        if let (Some(p), Some(prev_p)) = (percent, prev.as_ref().and_then(|p| p.percent)) {
            percent = Some(p.max(prev_p));
        }

        let eta_seconds = match (units_total, rate) {
            (Some(total), _) if units_processed >= total => Some(0.0),
            (Some(total), Some(rate)) if rate > 0.0 => Some((total - units_processed) as f64 / rate),
            _ => None,
        };

        let mut metrics = prev.map(|p| p.metrics).unwrap_or_default();
        metrics.extend(report.metrics);

        let snapshot = ProgressSnapshot {
            job_id,
            seq: report.seq,
            percent,
            units_processed,
            units_total,
            units_per_second: rate,
            eta_seconds,
            metrics,
            last_updated_at,
        };
        entry.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Latest snapshot; `None` if the job never reported or its history
    /// was evicted.
    pub fn get(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        let live = {
            let entries = self.entries.read().ok()?;
            entries.get(&job_id).cloned()
        };
        match live {
            Some(entry) => entry.lock().ok()?.snapshot.clone(),
            None => self.finished.lock().ok()?.snapshots.get(&job_id)?.clone(),
        }
    }

    /// Freeze a finished job's progress. Later reports for it are stale.
    pub fn close(&self, job_id: JobId) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let last = entries
            .remove(&job_id)
            .and_then(|entry| entry.lock().ok().and_then(|e| e.snapshot.clone()));
        let Ok(mut finished) = self.finished.lock() else {
            return;
        };
        if finished.snapshots.insert(job_id, last).is_none() {
            finished.order.push_back(job_id);
        }
        while finished.order.len() > self.finished_retention {
            if let Some(oldest) = finished.order.pop_front() {
                finished.snapshots.remove(&oldest);
            }
        }
    }

    /// Jobs with live progress state.
    pub fn live(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    /// Forget a job's progress; the next report starts fresh.
    pub fn reset(&self, job_id: JobId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&job_id);
        }
    }

    /// Reports rejected as stale since startup.
    pub fn stale_reports(&self) -> u64 {
        self.stale_reports.load(Ordering::Relaxed)
    }

    pub(crate) fn note_stale(&self) {
        self.stale_reports.fetch_add(1, Ordering::Relaxed);
    }
}
