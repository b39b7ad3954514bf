//! Checksum verification interface.
//!
//! The checker walks identical key ranges of the source and shadow tables
//! under a consistent snapshot, hashing each range (`CRC32` over
//! `GROUP_CONCAT` of the row image) and recopying any range that differs via
//! `INSERT ... SELECT ... ON DUPLICATE KEY UPDATE`.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::db::DbError;
use crate::table::ChunkerError;

/// Errors from the checksum phase.
#[derive(Debug, thiserror::Error)]
pub enum CheckerError {
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

/// Construction options for a checker.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Concurrent range checks.
    pub concurrency: usize,
    /// Time budget for one checksum range.
    pub target_chunk_time: Duration,
    /// Recopy differing ranges instead of only reporting them.
    pub fix_differences: bool,
}

/// Verifies source/shadow consistency over the full key range.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Check (and with `fix_differences`, repair) every range. Returns when
    /// the range is consumed; a nonzero difference count is reported through
    /// [`Checker::differences_found`], not as an error.
    async fn run(&self) -> Result<(), CheckerError>;

    /// Ranges that hashed differently during the run.
    fn differences_found(&self) -> u64;

    /// Total time spent checking.
    fn exec_time(&self) -> Duration;

    /// When the check started, if it has.
    fn start_time(&self) -> Option<Instant>;

    /// Human-readable completion figure, e.g. `"12/96 chunks"`.
    fn get_progress(&self) -> String;
}
