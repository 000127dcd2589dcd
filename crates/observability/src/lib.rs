//! Tracing, logging and metrics shared by the scheduler crates.

/// Initialize process-wide observability (tracing/logging) with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Initialize with an explicit output format.
pub fn init_with(format: tracing::LogFormat) {
    tracing::init(format);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Executor counters and gauges.
pub mod metrics;

pub use self::tracing::LogFormat;
pub use metrics::{JobExecutorMetrics, MetricsSnapshot};
