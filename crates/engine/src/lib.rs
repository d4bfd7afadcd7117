//! `quotaflow-engine`: the wired-up job lifecycle and metering engine.
//!
//! [`Engine`] assembles the quota meter, job registry, scheduler, metrics
//! aggregator and alert engine behind one facade. [`Engine::spawn`] drives
//! the periodic work on a background thread.

pub mod config;
pub mod engine;
pub mod sim;

pub use config::{ConfigError, EngineConfig};
pub use engine::{CycleReport, Engine, EngineHandle};
pub use sim::SimulatedExecutor;
