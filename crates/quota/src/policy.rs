//! Tier → limit table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use quotaflow_core::{ResourceKind, Tier};

/// A single limit; serialized as an integer where `-1` means unlimited.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Finite(u64),
}

impl Limit {
    pub fn from_i64(value: i64) -> Result<Self, PolicyError> {
        match value {
            -1 => Ok(Limit::Unlimited),
            v if v >= 0 => Ok(Limit::Finite(v as u64)),
            v => Err(PolicyError::InvalidLimit(v)),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Limit::Unlimited => -1,
            Limit::Finite(v) => i64::try_from(*v).unwrap_or(i64::MAX),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// Whether `total` stays within the limit.
    pub fn allows(&self, total: u64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Finite(limit) => total <= *limit,
        }
    }

    /// Remaining room above `used`; `None` when unlimited.
    pub fn headroom(&self, used: u64) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Finite(limit) => Some(limit.saturating_sub(used)),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Limit::from_i64(raw).map_err(serde::de::Error::custom)
    }
}

/// Limits attached to one subscription tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub monthly_tokens: Limit,
    pub monthly_training_hours: Limit,
    pub monthly_api_calls: Limit,
    pub max_concurrent_jobs: Limit,
    pub max_models: Limit,
}

impl TierLimits {
    /// Monthly limit for a consumable resource.
    pub fn resource(&self, kind: ResourceKind) -> Limit {
        match kind {
            ResourceKind::Tokens => self.monthly_tokens,
            ResourceKind::TrainingHours => self.monthly_training_hours,
            ResourceKind::ApiCalls => self.monthly_api_calls,
        }
    }
}

/// Policy loading failures.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid limit {0} (use -1 for unlimited)")]
    InvalidLimit(i64),
    #[error("policy is missing tier {0}")]
    MissingTier(Tier),
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable tier table. Never mutated by job activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaPolicy {
    tiers: BTreeMap<Tier, TierLimits>,
}

impl QuotaPolicy {
    /// Build a policy; every tier must be present.
    pub fn new(tiers: BTreeMap<Tier, TierLimits>) -> Result<Self, PolicyError> {
        if let Some(missing) = Tier::ALL.iter().find(|t| !tiers.contains_key(t)) {
            return Err(PolicyError::MissingTier(*missing));
        }
        Ok(Self { tiers })
    }

    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let tiers: BTreeMap<Tier, TierLimits> = serde_json::from_str(json)?;
        Self::new(tiers)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn limits(&self, tier: Tier) -> &TierLimits {
        // `new` guarantees every tier is present.
        &self.tiers[&tier]
    }
}

impl Default for QuotaPolicy {
    /// The published subscription plans.
    fn default() -> Self {
        use Limit::{Finite, Unlimited};

        let mut tiers = BTreeMap::new();
        tiers.insert(
            Tier::Free,
            TierLimits {
                monthly_tokens: Finite(1_000),
                monthly_training_hours: Finite(1),
                monthly_api_calls: Finite(1_000),
                max_concurrent_jobs: Finite(1),
                max_models: Finite(1),
            },
        );
        tiers.insert(
            Tier::Individual,
            TierLimits {
                monthly_tokens: Finite(50_000),
                monthly_training_hours: Finite(10),
                monthly_api_calls: Finite(10_000),
                max_concurrent_jobs: Finite(10),
                max_models: Finite(5),
            },
        );
        tiers.insert(
            Tier::Professional,
            TierLimits {
                monthly_tokens: Finite(500_000),
                monthly_training_hours: Finite(100),
                monthly_api_calls: Finite(100_000),
                max_concurrent_jobs: Finite(50),
                max_models: Finite(20),
            },
        );
        tiers.insert(
            Tier::Enterprise,
            TierLimits {
                monthly_tokens: Unlimited,
                monthly_training_hours: Unlimited,
                monthly_api_calls: Unlimited,
                max_concurrent_jobs: Unlimited,
                max_models: Unlimited,
            },
        );
        Self { tiers }
    }
}

/// Shared, hot-reloadable reference to the current policy.
///
/// Readers clone the inner `Arc` and keep a consistent table for the whole
/// operation even if a reload lands halfway through.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<QuotaPolicy>>,
}

impl PolicyHandle {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn current(&self) -> Arc<QuotaPolicy> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reload(&self, policy: QuotaPolicy) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
        info!("quota policy reloaded");
    }

    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let policy = QuotaPolicy::load(path)?;
        self.reload(policy);
        Ok(())
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(QuotaPolicy::default())
    }
}
