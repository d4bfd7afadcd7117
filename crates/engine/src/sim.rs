//! A stand-in executor for local runs and tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use quotaflow_core::{JobId, ResourceKind};
use quotaflow_jobs::{ExecutorError, JobExecutor, JobRegistry, JobStart, ProgressReport, ReportOutcome};

/// Runs each job on its own thread, reporting progress in `steps` equal
/// increments and then completing with the estimate as actual usage.
///
/// The executor must be [`attach`](Self::attach)ed to the registry it reports
/// to before it can start anything.
pub struct SimulatedExecutor {
    registry: OnceLock<Arc<JobRegistry>>,
    steps: u64,
    step_delay: Duration,
    cancelled: Arc<Mutex<HashSet<JobId>>>,
}

impl SimulatedExecutor {
    pub fn new(steps: u64, step_delay: Duration) -> Self {
        Self {
            registry: OnceLock::new(),
            steps: steps.max(1),
            step_delay,
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns false if already attached.
    pub fn attach(&self, registry: Arc<JobRegistry>) -> bool {
        self.registry.set(registry).is_ok()
    }
}

impl JobExecutor for SimulatedExecutor {
    fn start(&self, job: &JobStart) -> Result<(), ExecutorError> {
        let registry = self
            .registry
            .get()
            .cloned()
            .ok_or_else(|| ExecutorError::Unavailable("simulator not attached".into()))?;

        let job_id = job.job_id;
        let estimate = job.estimate.clone();
        let total = match estimate.get(ResourceKind::Tokens) {
            0 => 100,
            tokens => tokens,
        };
        let steps = self.steps;
        let delay = self.step_delay;
        let cancelled = self.cancelled.clone();

        thread::Builder::new()
            .name(format!("sim-{job_id}"))
            .spawn(move || {
                for seq in 1..=steps {
                    thread::sleep(delay);
                    if cancelled.lock().map(|c| c.contains(&job_id)).unwrap_or(false) {
                        debug!(job_id = %job_id, "simulated job cancelled");
                        return;
                    }
                    let report = ProgressReport::new(seq, share(total, seq, steps))
                        .with_total(total)
                        .with_metric("step", seq as f64);
                    match registry.report_progress(job_id, report) {
                        Ok(ReportOutcome::Applied(_)) => {}
                        // Stopped or failed elsewhere.
                        Ok(ReportOutcome::Ignored) => return,
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "simulated progress report failed");
                            return;
                        }
                    }
                }
                if let Err(e) = registry.complete(job_id, estimate) {
                    warn!(job_id = %job_id, error = %e, "simulated completion failed");
                }
            })
            .map(|_| ())
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))
    }

    fn cancel(&self, job_id: JobId) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.insert(job_id);
        }
    }
}

/// Units done after `seq` of `steps` equal steps, without overflowing.
fn share(total: u64, seq: u64, steps: u64) -> u64 {
    let units = u128::from(total) * u128::from(seq) / u128::from(steps.max(1));
    u64::try_from(units).unwrap_or(total)
}
