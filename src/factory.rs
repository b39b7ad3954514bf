//! Component construction seam.
//!
//! The runner builds its workstreams — pools, chunkers, copier, replication
//! client, checker, throttler — mid-lifecycle (setup, resume, and each
//! checksum attempt), so their constructors are gathered behind one trait.
//! Production wires the real implementations; tests substitute doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::check::CheckRunner;
use crate::checksum::{Checker, CheckerConfig, CheckerError};
use crate::copier::{Copier, CopierConfig, CopierError};
use crate::db::{Database, DbConfig, DbResult};
use crate::repl::{ReplClient, ReplClientConfig};
use crate::table::{Chunker, ChunkerError, TableInfo};
use crate::throttle::{ThrottleError, Throttler};

/// Builds every externally-implemented component the runner composes.
#[async_trait]
pub trait ComponentFactory: Send + Sync {
    /// Open a connection pool for `dsn`.
    async fn connect(&self, dsn: &str, config: &DbConfig) -> DbResult<Arc<dyn Database>>;

    /// Plan chunks over one source/shadow pair.
    async fn new_chunker(
        &self,
        source: Arc<TableInfo>,
        shadow: Arc<TableInfo>,
        target_chunk_time: Duration,
    ) -> Result<Arc<dyn Chunker>, ChunkerError>;

    /// Combine per-table chunkers for a multi-statement migration.
    fn new_multi_chunker(&self, chunkers: Vec<Arc<dyn Chunker>>) -> Arc<dyn Chunker>;

    /// Build the row copier over `chunker`.
    async fn new_copier(
        &self,
        db: Arc<dyn Database>,
        chunker: Arc<dyn Chunker>,
        config: CopierConfig,
    ) -> Result<Arc<dyn Copier>, CopierError>;

    /// Build the binlog replication client.
    fn new_repl_client(&self, db: Arc<dyn Database>, config: ReplClientConfig) -> Arc<dyn ReplClient>;

    /// Build a checksum checker over `chunker`.
    async fn new_checker(
        &self,
        db: Arc<dyn Database>,
        chunker: Arc<dyn Chunker>,
        repl: Arc<dyn ReplClient>,
        config: CheckerConfig,
    ) -> Result<Arc<dyn Checker>, CheckerError>;

    /// Build a replica-lag throttler sampling `replica`.
    async fn new_replica_throttler(
        &self,
        replica: Arc<dyn Database>,
        max_lag: Duration,
    ) -> Result<Arc<dyn Throttler>, ThrottleError>;

    /// The safety-check runner.
    fn check_runner(&self) -> Arc<dyn CheckRunner>;
}
