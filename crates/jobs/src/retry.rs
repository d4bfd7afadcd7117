//! Backoff for executor start-up failures.
//!
//! Delays double from `base_delay` up to `max_delay`. Each job is spread
//! within `±jitter` of the nominal delay by a fraction derived from its id,
//! so jobs refused together by a busy executor come back at different times.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use quotaflow_core::JobId;

/// How often, and how patiently, the scheduler retries a job whose executor
/// could not start it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed start (0 = fail on first error)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread as a fraction of the nominal delay, clamped to 0.0-1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before `job_id` is started again after `failures` failed starts.
    pub fn delay_for(&self, job_id: JobId, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let nominal = self.nominal(failures).as_millis() as f64;
        let range = nominal * self.jitter.clamp(0.0, 1.0);
        let offset = range * (spread(job_id, failures) * 2.0 - 1.0);
        Duration::from_millis((nominal + offset).max(0.0) as u64)
    }

    /// `base_delay * 2^(failures - 1)`, capped at `max_delay`.
    fn nominal(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another start may be attempted after `failures` failed starts.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// Fraction in `[0, 1]` fixed per job and attempt.
fn spread(job_id: JobId, failures: u32) -> f64 {
    let seed = job_id.as_uuid().as_u128() as u64;
    let mixed = seed ^ u64::from(failures).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed % 1_000) as f64 / 999.0
}
