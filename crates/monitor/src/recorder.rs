//! Inputs from the inference side: request outcomes and host load.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use quotaflow_core::{Clock, Tier};

use crate::snapshot::{ErrorRecord, ErrorSummary, ModelStats, RequestTotals, SystemStats};
use crate::window::{LatencyPercentiles, SampleWindow};

/// Failed requests remembered between snapshots.
pub const RECENT_ERRORS_CAPACITY: usize = 50;

/// Newest failed requests copied into each snapshot.
pub const SNAPSHOT_RECENT_ERRORS: usize = 10;

/// Error kind used when a failed sample carries no error details.
pub const UNKNOWN_ERROR_KIND: &str = "unknown";

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// Short machine-readable class, e.g. `timeout` or `rate_limited`.
    pub kind: String,
    pub message: String,
}

/// One completed inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub model: String,
    pub tier: Option<Tier>,
    pub latency: Duration,
    pub success: bool,
    /// Tokens generated, when the model reports them.
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub error: Option<RequestError>,
}

impl RequestSample {
    pub fn new(model: impl Into<String>, latency: Duration, success: bool) -> Self {
        Self {
            model: model.into(),
            tier: None,
            latency,
            success,
            tokens: 0,
            error: None,
        }
    }

    /// Mark the request failed with a classified error.
    pub fn with_error(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(RequestError {
            kind: kind.into(),
            message: message.into(),
        });
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

/// Host load percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ModelCounter {
    requests: u64,
    errors: u64,
    tokens: u64,
    busy: Duration,
}

#[derive(Debug)]
struct RecorderState {
    requests: u64,
    errors: u64,
    /// Cumulative since startup.
    error_kinds: BTreeMap<String, u64>,
    recent_errors: VecDeque<ErrorRecord>,
    models: BTreeMap<String, ModelCounter>,
    tiers: BTreeMap<Tier, (u64, u64)>,
    latency_ms: SampleWindow<f64>,
    cpu: SampleWindow<f64>,
    memory: SampleWindow<f64>,
}

/// What the aggregator takes from the recorder for one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecorderReadout {
    pub requests: RequestTotals,
    pub models: BTreeMap<String, ModelStats>,
    pub tiers: BTreeMap<Tier, RequestTotals>,
    pub latency: LatencyPercentiles,
    pub system: SystemStats,
    pub errors: ErrorSummary,
}

/// Collects request and system samples between snapshots.
///
/// Request counters cover the interval since the last [`drain`](Self::drain);
/// latency and system load are rolling windows that survive draining, and
/// error kinds are counted since startup.
pub struct RequestRecorder {
    clock: Arc<dyn Clock>,
    state: Mutex<RecorderState>,
}

impl RequestRecorder {
    pub fn new(latency_window: usize, system_window: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RecorderState {
                requests: 0,
                errors: 0,
                error_kinds: BTreeMap::new(),
                recent_errors: VecDeque::with_capacity(RECENT_ERRORS_CAPACITY),
                models: BTreeMap::new(),
                tiers: BTreeMap::new(),
                latency_ms: SampleWindow::new(latency_window),
                cpu: SampleWindow::new(system_window),
                memory: SampleWindow::new(system_window),
            }),
        }
    }

    pub fn record_request(&self, sample: RequestSample) {
        let at = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let failed = u64::from(!sample.success);

        if !sample.success {
            let (kind, message) = match &sample.error {
                Some(error) => (error.kind.clone(), error.message.clone()),
                None => (UNKNOWN_ERROR_KIND.to_string(), String::new()),
            };
            *state.error_kinds.entry(kind.clone()).or_default() += 1;
            if state.recent_errors.len() >= RECENT_ERRORS_CAPACITY {
                state.recent_errors.pop_front();
            }
            state.recent_errors.push_back(ErrorRecord {
                at,
                model: sample.model.clone(),
                kind,
                message,
            });
        }

        state.requests += 1;
        state.errors += failed;
        state.latency_ms.push(sample.latency.as_secs_f64() * 1000.0);

        let model = state.models.entry(sample.model).or_default();
        model.requests += 1;
        model.errors += failed;
        model.tokens += sample.tokens;
        model.busy += sample.latency;

        if let Some(tier) = sample.tier {
            let (total, errors) = state.tiers.entry(tier).or_default();
            *total += 1;
            *errors += failed;
        }
    }

    pub fn record_system(&self, sample: SystemSample) {
        if !sample.cpu_percent.is_finite() || !sample.memory_percent.is_finite() {
            warn!(?sample, "ignoring non-finite system sample");
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cpu.push(sample.cpu_percent.clamp(0.0, 100.0));
        state.memory.push(sample.memory_percent.clamp(0.0, 100.0));
    }

    /// Take the interval counters (resetting them) plus the rolling windows.
    pub fn drain(&self) -> RecorderReadout {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let models = std::mem::take(&mut state.models)
            .into_iter()
            .map(|(name, c)| {
                let busy_secs = c.busy.as_secs_f64();
                let stats = ModelStats {
                    requests: RequestTotals::new(c.requests, c.errors),
                    tokens: c.tokens,
                    tokens_per_second: if busy_secs > 0.0 {
                        c.tokens as f64 / busy_secs
                    } else {
                        0.0
                    },
                    avg_latency_ms: if c.requests > 0 {
                        busy_secs * 1000.0 / c.requests as f64
                    } else {
                        0.0
                    },
                };
                (name, stats)
            })
            .collect();

        let tiers = std::mem::take(&mut state.tiers)
            .into_iter()
            .map(|(tier, (total, errors))| (tier, RequestTotals::new(total, errors)))
            .collect();

        let readout = RecorderReadout {
            requests: RequestTotals::new(state.requests, state.errors),
            models,
            tiers,
            latency: state.latency_ms.percentiles(),
            system: SystemStats {
                cpu_percent: state.cpu.mean().unwrap_or(0.0),
                memory_percent: state.memory.mean().unwrap_or(0.0),
                samples: state.cpu.len(),
            },
            errors: ErrorSummary {
                by_kind: state.error_kinds.clone(),
                recent: state
                    .recent_errors
                    .iter()
                    .rev()
                    .take(SNAPSHOT_RECENT_ERRORS)
                    .rev()
                    .cloned()
                    .collect(),
            },
        };
        state.requests = 0;
        state.errors = 0;
        readout
    }
}
