//! Process-wide logging setup for quotaflow binaries.
//!
//! Library crates only emit `tracing` events; installing a subscriber is the
//! binary's job.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;
