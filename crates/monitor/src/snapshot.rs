//! Point-in-time dashboard metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use quotaflow_core::{ResourceKind, Tier};
use quotaflow_jobs::{JobCounts, JobState};
use quotaflow_quota::TierUsage;

use crate::window::LatencyPercentiles;

/// Request counts over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RequestTotals {
    pub total: u64,
    pub errors: u64,
    /// Percent, 0-100.
    pub error_rate: f64,
}

impl RequestTotals {
    pub fn new(total: u64, errors: u64) -> Self {
        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64 * 100.0
        };
        Self {
            total,
            errors,
            error_rate,
        }
    }

    pub fn merge(&self, other: &RequestTotals) -> Self {
        Self::new(self.total + other.total, self.errors + other.errors)
    }

    fn field(&self, name: &str) -> Option<f64> {
        match name {
            "total" | "requests" => Some(self.total as f64),
            "errors" => Some(self.errors as f64),
            "error_rate" => Some(self.error_rate),
            _ => None,
        }
    }
}

/// Per-model inference statistics over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelStats {
    pub requests: RequestTotals,
    pub tokens: u64,
    pub tokens_per_second: f64,
    pub avg_latency_ms: f64,
}

impl ModelStats {
    fn field(&self, name: &str) -> Option<f64> {
        match name {
            "tokens" => Some(self.tokens as f64),
            "tokens_per_second" => Some(self.tokens_per_second),
            "avg_latency_ms" => Some(self.avg_latency_ms),
            other => self.requests.field(other),
        }
    }
}

/// Host load averaged over the system sample window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub samples: usize,
}

/// Engine self-diagnostics (cumulative since startup).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub stale_progress_reports: u64,
    pub invalid_transitions: u64,
    pub overage_events: u64,
}

/// A failed inference request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub model: String,
    pub kind: String,
    pub message: String,
}

/// Request failures by kind since startup, plus the newest few.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub by_kind: BTreeMap<String, u64>,
    /// Oldest first.
    pub recent: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    /// Native intervals covered (1, or more once downsampled).
    pub span: u32,
    pub jobs: JobCounts,
    pub requests: RequestTotals,
    pub latency: LatencyPercentiles,
    pub models: BTreeMap<String, ModelStats>,
    pub tiers: BTreeMap<Tier, RequestTotals>,
    pub usage: BTreeMap<Tier, TierUsage>,
    pub system: SystemStats,
    pub errors: ErrorSummary,
    pub diagnostics: Diagnostics,
}

impl MetricSnapshot {
    /// Resolve a dotted metric path, e.g. `latency.p95` or
    /// `tiers.enterprise.error_rate`.
    ///
    /// Well-formed paths naming a model or tier without traffic resolve to
    /// zero; malformed paths resolve to `None`.
    pub fn value(&self, path: &str) -> Option<f64> {
        let (head, rest) = path.split_once('.')?;
        match head {
            "jobs" => {
                let state = JobState::ALL.into_iter().find(|s| s.as_str() == rest)?;
                Some(self.jobs.get(state) as f64)
            }
            "requests" => self.requests.field(rest),
            "latency" => match rest {
                "p50" => Some(self.latency.p50_ms),
                "p95" => Some(self.latency.p95_ms),
                "p99" => Some(self.latency.p99_ms),
                "samples" => Some(self.latency.samples as f64),
                _ => None,
            },
            "system" => match rest {
                "cpu" => Some(self.system.cpu_percent),
                "memory" => Some(self.system.memory_percent),
                _ => None,
            },
            // Model names may themselves contain dots.
            "models" => {
                let (model, field) = rest.rsplit_once('.')?;
                if model.is_empty() {
                    return None;
                }
                self.models.get(model).copied().unwrap_or_default().field(field)
            }
            "tiers" => {
                let (tier, field) = rest.split_once('.')?;
                let tier: Tier = tier.parse().ok()?;
                self.tiers.get(&tier).copied().unwrap_or_default().field(field)
            }
            "usage" => {
                let (tier, rest) = rest.split_once('.')?;
                let tier: Tier = tier.parse().ok()?;
                let usage = self.usage.get(&tier);
                if rest == "tenants" {
                    return Some(usage.map_or(0, |u| u.tenants) as f64);
                }
                let (resource, field) = rest.split_once('.')?;
                let resource: ResourceKind = resource.parse().ok()?;
                let totals = usage
                    .and_then(|u| u.resources.get(&resource).copied())
                    .unwrap_or_default();
                match field {
                    "reserved" => Some(totals.reserved as f64),
                    "consumed" => Some(totals.consumed as f64),
                    _ => None,
                }
            }
            // Any kind name is well-formed; unseen kinds count zero.
            "errors" if !rest.is_empty() => Some(self.errors.by_kind.get(rest).copied().unwrap_or(0) as f64),
            "diagnostics" => match rest {
                "stale_progress_reports" => Some(self.diagnostics.stale_progress_reports as f64),
                "invalid_transitions" => Some(self.diagnostics.invalid_transitions as f64),
                "overage_events" => Some(self.diagnostics.overage_events as f64),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether `path` has a known top-level section.
    pub fn is_known_section(path: &str) -> bool {
        let head = path.split('.').next().unwrap_or_default();
        matches!(
            head,
            "jobs" | "requests" | "latency" | "system" | "models" | "tiers" | "usage" | "errors" | "diagnostics"
        )
    }
}
