//! Metrics emission interface.
//!
//! The engine reports coarse counters through a sink so embedders can wire
//! them into their own telemetry. The default sink discards everything.

use std::time::Duration;

/// A single metric observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    /// Rows written to the shadow table by the copier.
    RowsCopied(u64),
    /// One copy chunk completed.
    ChunkProcessed {
        /// Rows in the chunk.
        rows: u64,
        /// Wall time the chunk took.
        duration: Duration,
    },
    /// Binlog deltas applied to the shadow table.
    DeltasApplied(u64),
}

/// Receives metric observations from the copier and replication applier.
pub trait MetricsSink: Send + Sync {
    /// Record one observation.
    fn record(&self, metric: Metric);
}

/// A sink that discards all observations.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _metric: Metric) {}
}
