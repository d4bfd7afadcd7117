//! Engine configuration.
//!
//! Precedence: built-in defaults, then the JSON file named by
//! `QUOTAFLOW_CONFIG`, then individual `QUOTAFLOW_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quotaflow_jobs::{RetryPolicy, SchedulerConfig};
use quotaflow_monitor::{AggregatorConfig, RuleError};
use quotaflow_quota::PolicyError;

pub const CONFIG_FILE_VAR: &str = "QUOTAFLOW_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Rules(#[from] RuleError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub global_capacity: usize,
    pub scheduler_interval_ms: u64,
    pub aggregation_interval_ms: u64,
    pub snapshot_capacity: usize,
    pub downsample_factor: usize,
    pub downsampled_capacity: usize,
    pub latency_window: usize,
    pub system_window: usize,
    pub progress_window: usize,
    pub start_retry_max_retries: u32,
    pub start_retry_base_ms: u64,
    pub start_retry_max_ms: u64,
    /// Fail running jobs with no progress for this long. Off when unset.
    pub stall_timeout_secs: Option<u64>,
    /// JSON tier table; the published plans when unset.
    pub policy_path: Option<PathBuf>,
    /// JSON array of alert rules; the built-in thresholds when unset.
    pub alert_rules_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_capacity: 16,
            scheduler_interval_ms: 1_000,
            aggregation_interval_ms: 15_000,
            snapshot_capacity: 5_760,
            downsample_factor: 20,
            downsampled_capacity: 1_440,
            latency_window: 1_000,
            system_window: 100,
            progress_window: 12,
            start_retry_max_retries: 3,
            start_retry_base_ms: 1_000,
            start_retry_max_ms: 60_000,
            stall_timeout_secs: None,
            policy_path: None,
            alert_rules_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_VAR).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(lookup, "QUOTAFLOW_GLOBAL_CAPACITY", &mut self.global_capacity)?;
        override_with(lookup, "QUOTAFLOW_SCHEDULER_INTERVAL_MS", &mut self.scheduler_interval_ms)?;
        override_with(lookup, "QUOTAFLOW_AGGREGATION_INTERVAL_MS", &mut self.aggregation_interval_ms)?;
        override_with(lookup, "QUOTAFLOW_SNAPSHOT_CAPACITY", &mut self.snapshot_capacity)?;
        override_with(lookup, "QUOTAFLOW_DOWNSAMPLE_FACTOR", &mut self.downsample_factor)?;
        override_with(lookup, "QUOTAFLOW_DOWNSAMPLED_CAPACITY", &mut self.downsampled_capacity)?;
        override_with(lookup, "QUOTAFLOW_LATENCY_WINDOW", &mut self.latency_window)?;
        override_with(lookup, "QUOTAFLOW_SYSTEM_WINDOW", &mut self.system_window)?;
        override_with(lookup, "QUOTAFLOW_PROGRESS_WINDOW", &mut self.progress_window)?;
        override_with(lookup, "QUOTAFLOW_START_RETRY_MAX_RETRIES", &mut self.start_retry_max_retries)?;
        override_with(lookup, "QUOTAFLOW_START_RETRY_BASE_MS", &mut self.start_retry_base_ms)?;
        override_with(lookup, "QUOTAFLOW_START_RETRY_MAX_MS", &mut self.start_retry_max_ms)?;

        if let Some(raw) = lookup("QUOTAFLOW_STALL_TIMEOUT_SECS") {
            self.stall_timeout_secs = match raw.trim() {
                "" | "off" => None,
                value => Some(parse_var("QUOTAFLOW_STALL_TIMEOUT_SECS", value)?),
            };
        }
        if let Some(path) = lookup("QUOTAFLOW_POLICY_PATH") {
            self.policy_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("QUOTAFLOW_ALERT_RULES_PATH") {
            self.alert_rules_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("global_capacity", self.global_capacity as u64),
            ("scheduler_interval_ms", self.scheduler_interval_ms),
            ("aggregation_interval_ms", self.aggregation_interval_ms),
            ("snapshot_capacity", self.snapshot_capacity as u64),
            ("downsample_factor", self.downsample_factor as u64),
            ("latency_window", self.latency_window as u64),
            ("system_window", self.system_window as u64),
            ("progress_window", self.progress_window as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be positive")));
        }
        if self.start_retry_base_ms > self.start_retry_max_ms {
            return Err(ConfigError::Invalid(
                "start_retry_base_ms exceeds start_retry_max_ms".into(),
            ));
        }
        if self.stall_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("stall_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn stall_timeout(&self) -> Option<chrono::Duration> {
        self.stall_timeout_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            global_capacity: self.global_capacity,
            retry: RetryPolicy::new(
                self.start_retry_max_retries,
                Duration::from_millis(self.start_retry_base_ms),
                Duration::from_millis(self.start_retry_max_ms),
            ),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            interval: Duration::from_millis(self.aggregation_interval_ms),
            snapshot_capacity: self.snapshot_capacity,
            downsample_factor: self.downsample_factor,
            downsampled_capacity: self.downsampled_capacity,
        }
    }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = parse_var(key, &raw)?;
    }
    Ok(())
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
