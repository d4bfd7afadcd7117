//! Bounded sample windows.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// The most recent `capacity` samples; the oldest is evicted on overflow.
#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> SampleWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }
}

impl SampleWindow<f64> {
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        LatencyPercentiles {
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
            samples: sorted.len(),
        }
    }
}

/// Nearest rank by index: `sorted[floor(n * q)]`, clamped to the last sample.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q.clamp(0.0, 1.0)) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Response-time percentiles over the rolling window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}
