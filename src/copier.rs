//! Row copier interface.
//!
//! The copier multiplexes up to `concurrency` chunk copies, each an
//! `INSERT IGNORE INTO shadow SELECT * FROM source WHERE key BETWEEN lo AND
//! hi`. `IGNORE` is required because the replication applier may already
//! have inserted a row the copier is about to claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::db::DbError;
use crate::metrics::MetricsSink;
use crate::table::{ChunkerError, Datum};
use crate::throttle::Throttler;

/// Errors from the copy phase.
#[derive(Debug, thiserror::Error)]
pub enum CopierError {
    /// A chunk copy failed and retries were exhausted.
    #[error("chunk copy failed: {0}")]
    ChunkFailed(String),
    /// Chunk planning failed.
    #[error(transparent)]
    Chunker(#[from] ChunkerError),
    /// Database failure.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Implementation-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Construction options for a copier.
#[derive(Clone)]
pub struct CopierConfig {
    /// Concurrent chunk copies.
    pub concurrency: usize,
    /// Per-chunk time budget the chunker sizes against.
    pub target_chunk_time: Duration,
    /// Whether a checksum will run after the copy. Copiers may relax
    /// duplicate handling when a verification pass is guaranteed.
    pub final_checksum: bool,
    /// Gate consulted between chunks.
    pub throttler: Arc<dyn Throttler>,
    /// Sink for copy metrics.
    pub metrics: Arc<dyn MetricsSink>,
}

/// Drives chunk copies until the source key range is consumed.
#[async_trait]
pub trait Copier: Send + Sync {
    /// Copy every remaining chunk. Returns when the range is consumed.
    async fn run(&self) -> Result<(), CopierError>;

    /// Whether `key` is above the copy frontier. The replication applier may
    /// skip events above the frontier because the copier will reach them.
    fn key_above_high_watermark(&self, key: &Datum) -> bool;

    /// Human-readable completion figure, e.g. `"54.2%"`.
    fn get_progress(&self) -> String;

    /// Human-readable time-to-completion estimate.
    fn get_eta(&self) -> String;

    /// Total time spent copying.
    fn exec_time(&self) -> Duration;

    /// When the copy started, if it has.
    fn start_time(&self) -> Option<Instant>;

    /// Replace the throttler consulted between chunks.
    fn set_throttler(&self, throttler: Arc<dyn Throttler>);

    /// Whether the copier is currently held by its throttler.
    fn is_throttled(&self) -> bool;
}
