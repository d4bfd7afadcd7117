//! Dashboard metrics and threshold alerting.
//!
//! - `RequestRecorder`: inference-side request and system samples
//! - `MetricsAggregator`: periodic `MetricSnapshot`s kept in a bounded, downsampling buffer
//! - `AlertEngine`: edge-triggered threshold rules over snapshots

pub mod aggregator;
pub mod alerts;
pub mod buffer;
pub mod recorder;
pub mod snapshot;
pub mod window;

pub use aggregator::{AggregatorConfig, MetricsAggregator};
pub use alerts::{
    Alert, AlertEngine, AlertEvent, AlertRule, AlertSink, Comparison, InMemoryAlertSink, RuleError,
    RuleSpec, Severity,
};
pub use buffer::SnapshotBuffer;
pub use recorder::{RecorderReadout, RequestError, RequestRecorder, RequestSample, SystemSample};
pub use snapshot::{Diagnostics, ErrorRecord, ErrorSummary, MetricSnapshot, ModelStats, RequestTotals, SystemStats};
pub use window::{LatencyPercentiles, SampleWindow};
