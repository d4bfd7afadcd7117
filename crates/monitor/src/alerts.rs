//! Threshold rules evaluated against each snapshot.
//!
//! Rules are written as `<metric-path> <op> <threshold>[%|ms] [for tier=<tier>|model=<name>]`,
//! for example `requests.error_rate > 5%` or `error_rate > 10% for tier=enterprise`.
//! Evaluation is edge-triggered: a rule emits [`AlertEvent::Fired`] when its
//! condition starts holding and [`AlertEvent::Resolved`] when it stops.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quotaflow_core::Tier;

use crate::snapshot::MetricSnapshot;

/// Alert events kept for dashboards.
pub const DEFAULT_HISTORY: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }

    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => value == threshold,
            Comparison::Ne => value != threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            "==" => Comparison::Eq,
            "!=" => Comparison::Ne,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("malformed rule `{expr}`: {reason}")]
    Syntax { expr: String, reason: String },

    #[error("rule `{expr}` names unknown metric `{metric}`")]
    UnknownMetric { expr: String, metric: String },

    #[error("rule {rule}: metric `{metric}` did not resolve")]
    Unresolved { rule: String, metric: String },

    #[error("cannot read alert rules: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse alert rules: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuleError {
    fn syntax(expr: &str, reason: impl Into<String>) -> Self {
        RuleError::Syntax {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRule {
    pub name: String,
    /// Resolved metric path.
    pub metric: String,
    pub op: Comparison,
    pub threshold: f64,
    pub severity: Severity,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        op: Comparison,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            op,
            threshold,
            severity,
        }
    }

    pub fn parse(name: impl Into<String>, expr: &str, severity: Severity) -> Result<Self, RuleError> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        let (path, op, threshold, scope) = match tokens.as_slice() {
            [path, op, threshold] => (*path, *op, *threshold, None),
            [path, op, threshold, "for", scope] => (*path, *op, *threshold, Some(*scope)),
            [] => return Err(RuleError::syntax(expr, "empty expression")),
            _ => {
                return Err(RuleError::syntax(
                    expr,
                    "expected `<metric> <op> <threshold> [for tier=<tier>|model=<name>]`",
                ));
            }
        };

        let op: Comparison = op
            .parse()
            .map_err(|_| RuleError::syntax(expr, format!("unknown operator `{op}`")))?;

        let number = threshold
            .strip_suffix('%')
            .or_else(|| threshold.strip_suffix("ms"))
            .unwrap_or(threshold);
        let threshold: f64 = number
            .parse()
            .ok()
            .filter(|t: &f64| t.is_finite())
            .ok_or_else(|| RuleError::syntax(expr, format!("bad threshold `{threshold}`")))?;

        let metric = match scope {
            None => path.to_string(),
            Some(scope) => {
                let field = path.rsplit('.').next().unwrap_or(path);
                match scope.split_once('=') {
                    Some(("tier", tier)) => {
                        let tier: Tier = tier
                            .parse()
                            .map_err(|_| RuleError::syntax(expr, format!("unknown tier `{tier}`")))?;
                        format!("tiers.{}.{field}", tier.as_str())
                    }
                    Some(("model", model)) if !model.is_empty() => format!("models.{model}.{field}"),
                    _ => return Err(RuleError::syntax(expr, format!("bad scope `{scope}`"))),
                }
            }
        };

        if !MetricSnapshot::is_known_section(&metric) {
            return Err(RuleError::UnknownMetric {
                expr: expr.to_string(),
                metric,
            });
        }

        Ok(Self::new(name, metric, op, threshold, severity))
    }

    /// The monitoring thresholds the dashboard ships with.
    pub fn defaults() -> Vec<AlertRule> {
        vec![
            AlertRule::new("high_latency", "latency.p95", Comparison::Gt, 2_000.0, Severity::Warning),
            AlertRule::new("high_error_rate", "requests.error_rate", Comparison::Gt, 5.0, Severity::Critical),
            AlertRule::new("high_cpu", "system.cpu", Comparison::Gt, 80.0, Severity::Warning),
            AlertRule::new("high_memory", "system.memory", Comparison::Gt, 85.0, Severity::Warning),
        ]
    }
}

impl fmt::Display for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.op, self.threshold)
    }
}

/// A rule as written in a rules file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub expr: String,
    #[serde(default)]
    pub severity: Severity,
}

impl RuleSpec {
    pub fn from_json(json: &str) -> Result<Vec<RuleSpec>, RuleError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Vec<RuleSpec>, RuleError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn compile(&self) -> Result<AlertRule, RuleError> {
        AlertRule::parse(self.name.clone(), &self.expr, self.severity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule: String,
    pub severity: Severity,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub op: Comparison,
    pub message: String,
    pub at: DateTime<Utc>,
    pub snapshot_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "alert", rename_all = "snake_case")]
pub enum AlertEvent {
    Fired(Alert),
    Resolved(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Fired(alert) | AlertEvent::Resolved(alert) => alert,
        }
    }

    pub fn is_fired(&self) -> bool {
        matches!(self, AlertEvent::Fired(_))
    }
}

/// Receives alert events (notification collaborator).
pub trait AlertSink: Send + Sync {
    fn deliver(&self, event: &AlertEvent);
}

impl<T: AlertSink + ?Sized> AlertSink for Arc<T> {
    fn deliver(&self, event: &AlertEvent) {
        (**self).deliver(event)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn deliver(&self, event: &AlertEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[derive(Debug)]
struct RuleSlot {
    rule: AlertRule,
    active: Option<Alert>,
}

#[derive(Debug, Default)]
struct EngineState {
    slots: Vec<RuleSlot>,
    recent: VecDeque<AlertEvent>,
}

pub struct AlertEngine {
    state: Mutex<EngineState>,
    sink: Arc<dyn AlertSink>,
    history: usize,
    rule_errors: AtomicU64,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                slots: rules.into_iter().map(|rule| RuleSlot { rule, active: None }).collect(),
                recent: VecDeque::new(),
            }),
            sink,
            history: DEFAULT_HISTORY,
            rule_errors: AtomicU64::new(0),
        }
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    /// Compile rule specs, skipping (and counting) the ones that do not parse.
    pub fn compile(&self, specs: &[RuleSpec]) -> Vec<AlertRule> {
        specs
            .iter()
            .filter_map(|spec| match spec.compile() {
                Ok(rule) => Some(rule),
                Err(err) => {
                    warn!(rule = %spec.name, error = %err, "skipping malformed alert rule");
                    self.rule_errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            })
            .collect()
    }

    /// Swap the rule set. Unchanged rules keep their active alert.
    pub fn replace_rules(&self, rules: Vec<AlertRule>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut previous = std::mem::take(&mut state.slots);
        state.slots = rules
            .into_iter()
            .map(|rule| {
                let active = previous
                    .iter_mut()
                    .find(|slot| slot.rule == rule)
                    .and_then(|slot| slot.active.take());
                RuleSlot { rule, active }
            })
            .collect();
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.slots.iter().map(|slot| slot.rule.clone()).collect()
    }

    /// Evaluate every rule against `snapshot`.
    ///
    /// Returns only state changes. A rule whose metric does not resolve is
    /// logged and counted; it keeps its previous state.
    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for slot in state.slots.iter_mut() {
                let Some(value) = snapshot.value(&slot.rule.metric) else {
                    let err = RuleError::Unresolved {
                        rule: slot.rule.name.clone(),
                        metric: slot.rule.metric.clone(),
                    };
                    warn!(error = %err, "alert rule evaluation failed");
                    self.rule_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                };

                let holding = slot.rule.op.holds(value, slot.rule.threshold);
                match (holding, slot.active.is_some()) {
                    (true, false) => {
                        let alert = fired(&slot.rule, value, snapshot);
                        slot.active = Some(alert.clone());
                        events.push(AlertEvent::Fired(alert));
                    }
                    (false, true) => {
                        slot.active = None;
                        events.push(AlertEvent::Resolved(resolved(&slot.rule, value, snapshot)));
                    }
                    _ => {}
                }
            }

            for event in &events {
                if state.recent.len() >= self.history {
                    state.recent.pop_front();
                }
                state.recent.push_back(event.clone());
            }
        }

        for event in &events {
            let alert = event.alert();
            if event.is_fired() {
                warn!(rule = %alert.rule, severity = %alert.severity, value = alert.value, "{}", alert.message);
            } else {
                info!(rule = %alert.rule, value = alert.value, "{}", alert.message);
            }
            self.sink.deliver(event);
        }
        events
    }

    /// Alerts currently firing.
    pub fn active(&self) -> Vec<Alert> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.slots.iter().filter_map(|slot| slot.active.clone()).collect()
    }

    /// Most recent alert events, oldest first.
    pub fn recent(&self) -> Vec<AlertEvent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.recent.iter().cloned().collect()
    }

    pub fn rule_errors(&self) -> u64 {
        self.rule_errors.load(Ordering::Relaxed)
    }
}

fn fired(rule: &AlertRule, value: f64, snapshot: &MetricSnapshot) -> Alert {
    alert(
        rule,
        value,
        snapshot,
        format!("{} is {value:.2} ({} {:.2})", rule.metric, rule.op, rule.threshold),
    )
}

fn resolved(rule: &AlertRule, value: f64, snapshot: &MetricSnapshot) -> Alert {
    alert(
        rule,
        value,
        snapshot,
        format!("{} back to {value:.2}", rule.metric),
    )
}

fn alert(rule: &AlertRule, value: f64, snapshot: &MetricSnapshot, message: String) -> Alert {
    Alert {
        rule: rule.name.clone(),
        severity: rule.severity,
        metric: rule.metric.clone(),
        value,
        threshold: rule.threshold,
        op: rule.op,
        message,
        at: snapshot.taken_at,
        snapshot_seq: snapshot.seq,
    }
}
