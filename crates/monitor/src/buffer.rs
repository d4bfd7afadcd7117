//! Bounded snapshot history with downsampling.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::snapshot::{MetricSnapshot, ModelStats, RequestTotals, SystemStats};
use crate::window::LatencyPercentiles;

/// Two bounded rings: native-resolution snapshots, and coarse snapshots that
/// each fold `downsample_factor` evicted natives.
///
/// Neither ring ever holds more than its capacity; at most
/// `downsample_factor - 1` evicted snapshots wait to be folded.
#[derive(Debug)]
pub struct SnapshotBuffer {
    native: VecDeque<Arc<MetricSnapshot>>,
    native_capacity: usize,
    pending: Vec<Arc<MetricSnapshot>>,
    downsample_factor: usize,
    coarse: VecDeque<Arc<MetricSnapshot>>,
    coarse_capacity: usize,
}

impl SnapshotBuffer {
    pub fn new(native_capacity: usize, downsample_factor: usize, coarse_capacity: usize) -> Self {
        Self {
            native: VecDeque::new(),
            native_capacity: native_capacity.max(1),
            pending: Vec::new(),
            downsample_factor: downsample_factor.max(1),
            coarse: VecDeque::new(),
            coarse_capacity,
        }
    }

    pub fn push(&mut self, snapshot: Arc<MetricSnapshot>) {
        self.native.push_back(snapshot);
        while self.native.len() > self.native_capacity {
            let Some(evicted) = self.native.pop_front() else {
                break;
            };
            self.pending.push(evicted);
            if self.pending.len() >= self.downsample_factor {
                let folded = fold(&self.pending);
                self.pending.clear();
                if self.coarse_capacity > 0 {
                    self.coarse.push_back(Arc::new(folded));
                }
                while self.coarse.len() > self.coarse_capacity {
                    self.coarse.pop_front();
                }
            }
        }
    }

    pub fn latest(&self) -> Option<Arc<MetricSnapshot>> {
        self.native.back().cloned()
    }

    /// Native snapshots, oldest first.
    pub fn native(&self) -> Vec<Arc<MetricSnapshot>> {
        self.native.iter().cloned().collect()
    }

    /// Downsampled snapshots, oldest first.
    pub fn downsampled(&self) -> Vec<Arc<MetricSnapshot>> {
        self.coarse.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_empty()
    }

    pub fn downsampled_len(&self) -> usize {
        self.coarse.len()
    }
}

/// Merge consecutive snapshots into one covering their whole span.
fn fold(snapshots: &[Arc<MetricSnapshot>]) -> MetricSnapshot {
    let newest = &snapshots[snapshots.len() - 1];
    let n = snapshots.len() as f64;

    let mut requests = RequestTotals::default();
    let mut latency = LatencyPercentiles::default();
    let mut tiers = BTreeMap::new();
    let mut models: BTreeMap<String, (RequestTotals, u64, f64, f64)> = BTreeMap::new();
    let (mut cpu, mut memory, mut system_samples) = (0.0, 0.0, 0);
    let mut span = 0u32;

    for snap in snapshots {
        span = span.saturating_add(snap.span);
        requests = requests.merge(&snap.requests);

        latency.p50_ms = latency.p50_ms.max(snap.latency.p50_ms);
        latency.p95_ms = latency.p95_ms.max(snap.latency.p95_ms);
        latency.p99_ms = latency.p99_ms.max(snap.latency.p99_ms);
        latency.samples = latency.samples.max(snap.latency.samples);

        for (tier, totals) in &snap.tiers {
            let entry = tiers.entry(*tier).or_insert_with(RequestTotals::default);
            *entry = entry.merge(totals);
        }

        // Rates are re-weighted by request count.
        for (name, stats) in &snap.models {
            let weight = stats.requests.total as f64;
            let entry = models.entry(name.clone()).or_default();
            entry.0 = entry.0.merge(&stats.requests);
            entry.1 += stats.tokens;
            entry.2 += stats.tokens_per_second * weight;
            entry.3 += stats.avg_latency_ms * weight;
        }

        cpu += snap.system.cpu_percent;
        memory += snap.system.memory_percent;
        system_samples = system_samples.max(snap.system.samples);
    }

    let models = models
        .into_iter()
        .map(|(name, (totals, tokens, tps, latency))| {
            let weight = totals.total as f64;
            let avg = |sum: f64| if weight > 0.0 { sum / weight } else { 0.0 };
            (
                name,
                ModelStats {
                    requests: totals,
                    tokens,
                    tokens_per_second: avg(tps),
                    avg_latency_ms: avg(latency),
                },
            )
        })
        .collect();

    MetricSnapshot {
        seq: newest.seq,
        taken_at: newest.taken_at,
        span,
        jobs: newest.jobs,
        requests,
        latency,
        models,
        tiers,
        usage: newest.usage.clone(),
        system: SystemStats {
            cpu_percent: cpu / n,
            memory_percent: memory / n,
            samples: system_samples,
        },
        errors: newest.errors.clone(),
        diagnostics: newest.diagnostics,
    }
}
