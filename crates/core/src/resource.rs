//! Consumable resources and quantities of them.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A metered, consumable resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tokens,
    /// Metered in whole hours; partial hours round up.
    TrainingHours,
    ApiCalls,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Tokens,
        ResourceKind::TrainingHours,
        ResourceKind::ApiCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Tokens => "tokens",
            ResourceKind::TrainingHours => "training_hours",
            ResourceKind::ApiCalls => "api_calls",
        }
    }

    /// Human-readable unit, used in quota denial messages.
    pub fn unit(&self) -> &'static str {
        match self {
            ResourceKind::Tokens => "tokens",
            ResourceKind::TrainingHours => "training hours",
            ResourceKind::ApiCalls => "API calls",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tokens" => Ok(ResourceKind::Tokens),
            "training_hours" => Ok(ResourceKind::TrainingHours),
            "api_calls" => Ok(ResourceKind::ApiCalls),
            other => Err(EngineError::validation(format!("unknown resource: {other}"))),
        }
    }
}

/// Amounts of one or more resources: a job estimate, or actual consumption.
///
/// Kinds with a zero amount are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceUsage(BTreeMap<ResourceKind, u64>);

impl ResourceUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(amount: u64) -> Self {
        Self::new().with(ResourceKind::Tokens, amount)
    }

    pub fn training_hours(amount: u64) -> Self {
        Self::new().with(ResourceKind::TrainingHours, amount)
    }

    pub fn api_calls(amount: u64) -> Self {
        Self::new().with(ResourceKind::ApiCalls, amount)
    }

    /// Training time converted to billable hours (rounded up).
    pub fn training_time(elapsed: Duration) -> Self {
        let secs = elapsed.as_secs() + u64::from(elapsed.subsec_nanos() > 0);
        Self::training_hours(secs.div_ceil(3600))
    }

    /// Builder-style setter; a zero amount removes the kind.
    pub fn with(mut self, kind: ResourceKind, amount: u64) -> Self {
        self.set(kind, amount);
        self
    }

    pub fn set(&mut self, kind: ResourceKind, amount: u64) {
        if amount == 0 {
            self.0.remove(&kind);
        } else {
            self.0.insert(kind, amount);
        }
    }

    pub fn add(&mut self, kind: ResourceKind, amount: u64) {
        let current = self.get(kind);
        self.set(kind, current.saturating_add(amount));
    }

    pub fn get(&self, kind: ResourceKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(ResourceKind, u64)> for ResourceUsage {
    fn from_iter<I: IntoIterator<Item = (ResourceKind, u64)>>(iter: I) -> Self {
        let mut usage = ResourceUsage::new();
        for (kind, amount) in iter {
            usage.add(kind, amount);
        }
        usage
    }
}
