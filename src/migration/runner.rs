//! Migration runner.
//!
//! Composes the copy, replication, throttle, checksum, and checkpoint
//! workstreams under one lifecycle. [`Runner::run`] is the single entry
//! point; background tasks are bound to a shutdown broadcast and the current
//! stage is readable from anywhere through an atomic register.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::check::{CheckResources, CheckScope};
use crate::checksum::{Checker, CheckerConfig};
use crate::copier::{Copier, CopierConfig};
use crate::db::{self, ident, Database, DbConfig, MetadataLock, Param, SqlRow, SqlValue};
use crate::factory::ComponentFactory;
use crate::metrics::{MetricsSink, NoopSink};
use crate::repl::{
    encode_schema_table, BinlogPosition, ReplClient, ReplClientConfig, WatermarkGate,
    DEFAULT_FLUSH_INTERVAL,
};
use crate::table::{Chunker, TableInfo};
use crate::throttle::{NoopThrottler, Throttler};

use super::change::{Change, FastPathDdl};
use super::cutover::{CutOver, CutoverTarget};
use super::state::{Stage, StageRegister};
use super::{Migration, MigrationError, Result};

/// The operator-controlled table whose presence blocks cutover.
pub const SENTINEL_TABLE_NAME: &str = "_spirit_sentinel";

pub(crate) const CHECKPOINT_DUMP_INTERVAL: Duration = Duration::from_secs(50);
pub(crate) const TABLE_STAT_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub(crate) const STATUS_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const SENTINEL_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const SENTINEL_WAIT_LIMIT: Duration = Duration::from_secs(48 * 60 * 60);

const CHECKSUM_ATTEMPTS: u32 = 3;

// Column layout of the checkpoint table. Resume decodes `SELECT *` and any
// divergence from this layout means the checkpoint was written by a
// different version, which is not recoverable.
const CHECKPOINT_COLUMNS: [&str; 7] = [
    "id",
    "copier_watermark",
    "checksum_watermark",
    "binlog_name",
    "binlog_pos",
    "rows_copied",
    "alter_statement",
];

/// A snapshot of migration progress for external pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    /// Current lifecycle stage, e.g. `"copyRows"`.
    pub current_state: String,
    /// Stage-dependent summary, e.g. `"54.2% copyRows ETA 1h30m"`.
    pub summary: String,
    /// When the run began.
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CheckpointRow {
    copier_watermark: String,
    checksum_watermark: String,
    binlog_name: String,
    binlog_pos: u32,
    rows_copied: u64,
    alter_statement: String,
}

impl CheckpointRow {
    fn decode(row: &SqlRow) -> std::result::Result<Self, String> {
        if row.columns != CHECKPOINT_COLUMNS {
            return Err(format!(
                "checkpoint table layout has changed (columns: {:?})",
                row.columns
            ));
        }
        let text = |i: usize| -> String {
            match &row.values[i] {
                SqlValue::Text(s) => s.clone(),
                _ => String::new(),
            }
        };
        let binlog_pos = row.values[4]
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| "binlog_pos is not a valid position".to_string())?;
        let rows_copied = row.values[5]
            .as_u64()
            .ok_or_else(|| "rows_copied is not a valid count".to_string())?;
        Ok(Self {
            copier_watermark: text(1),
            checksum_watermark: text(2),
            binlog_name: text(3),
            binlog_pos,
            rows_copied,
            alter_statement: text(6),
        })
    }
}

// Why resume could not proceed, and what the caller should do about it.
#[derive(Debug, thiserror::Error)]
enum ResumeError {
    // The checkpoint belongs to a different ALTER; fatal under strict.
    #[error("the checkpoint was written by a different ALTER statement")]
    Mismatched,
    // The checkpoint exists but cannot be used (binlog purged); surfaced to
    // the caller rather than silently redoing the copy.
    #[error("{0}")]
    Impossible(String),
    // No usable checkpoint; fall through to fresh setup.
    #[error("{0}")]
    Fallback(String),
}

// The checker and its chunker are replaced together across checksum
// retries while the status and checkpoint tasks read them.
#[derive(Default)]
struct CheckerState {
    checker: Option<Arc<dyn Checker>>,
    chunker: Option<Arc<dyn Chunker>>,
}

/// Drives one migration from statement to swapped table.
pub struct Runner {
    migration: Migration,
    factory: Arc<dyn ComponentFactory>,
    metrics: Arc<dyn MetricsSink>,
    changes: Vec<Change>,

    state: StageRegister,
    checksum_enabled: AtomicBool,

    db: RwLock<Option<Arc<dyn Database>>>,
    replica: RwLock<Option<Arc<dyn Database>>>,
    copier: RwLock<Option<Arc<dyn Copier>>>,
    repl_client: RwLock<Option<Arc<dyn ReplClient>>>,
    throttler: RwLock<Option<Arc<dyn Throttler>>>,
    copy_chunker: RwLock<Option<Arc<dyn Chunker>>>,
    checkpoint_table: RwLock<Option<Arc<TableInfo>>>,

    checker: Mutex<CheckerState>,
    checksum_watermark: Mutex<Option<String>>,

    start_time: RwLock<Option<Instant>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    sentinel_wait_start: RwLock<Option<Instant>>,

    used_instant_ddl: AtomicBool,
    used_inplace_ddl: AtomicBool,
    used_resume_from_checkpoint: AtomicBool,

    shutdown: broadcast::Sender<()>,
}

impl Runner {
    /// Build a runner for `migration`. The request is validated here so a
    /// bad configuration never reaches the server.
    pub fn new(migration: Migration, factory: Arc<dyn ComponentFactory>) -> Result<Self> {
        migration.validate()?;
        let changes = migration
            .statements
            .iter()
            .cloned()
            .map(Change::new)
            .collect();
        let checksum = migration.checksum;
        let (shutdown, _) = broadcast::channel(4);
        Ok(Self {
            migration,
            factory,
            metrics: Arc::new(NoopSink),
            changes,
            state: StageRegister::new(),
            checksum_enabled: AtomicBool::new(checksum),
            db: RwLock::new(None),
            replica: RwLock::new(None),
            copier: RwLock::new(None),
            repl_client: RwLock::new(None),
            throttler: RwLock::new(None),
            copy_chunker: RwLock::new(None),
            checkpoint_table: RwLock::new(None),
            checker: Mutex::new(CheckerState::default()),
            checksum_watermark: Mutex::new(None),
            start_time: RwLock::new(None),
            started_at: RwLock::new(None),
            sentinel_wait_start: RwLock::new(None),
            used_instant_ddl: AtomicBool::new(false),
            used_inplace_ddl: AtomicBool::new(false),
            used_resume_from_checkpoint: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Replace the metrics sink. Must be called before [`Runner::run`].
    pub fn set_metrics_sink(&mut self, sink: Arc<dyn MetricsSink>) {
        self.metrics = sink;
    }

    /// Whether the change completed via `ALGORITHM=INSTANT`.
    pub fn used_instant_ddl(&self) -> bool {
        self.used_instant_ddl.load(Ordering::Acquire)
    }

    /// Whether the change completed via `ALGORITHM=INPLACE`.
    pub fn used_inplace_ddl(&self) -> bool {
        self.used_inplace_ddl.load(Ordering::Acquire)
    }

    /// Whether the run re-attached to a prior checkpoint.
    pub fn used_resume_from_checkpoint(&self) -> bool {
        self.used_resume_from_checkpoint.load(Ordering::Acquire)
    }

    /// Whether verification will run before cutover.
    pub fn checksum_enabled(&self) -> bool {
        self.checksum_enabled.load(Ordering::Acquire)
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> Stage {
        self.state.get()
    }

    /// Run the migration to completion.
    ///
    /// Any error before the rename leaves the shadow and checkpoint tables
    /// in place so a re-run can resume. Background tasks started by the run
    /// are shut down on both success and failure.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let result = self.run_inner().await;
        let _ = self.shutdown.send(());
        if result.is_err() {
            self.state.set(Stage::ErrCleanup);
        }
        result
    }

    async fn run_inner(self: &Arc<Self>) -> Result<()> {
        *self.start_time.write() = Some(Instant::now());
        *self.started_at.write() = Some(Utc::now());
        info!(
            concurrency = self.migration.threads,
            target_chunk_time = ?self.migration.target_chunk_time,
            statements = self.changes.len(),
            "starting schema migration"
        );

        // The copier and replication applier share this pool; the +1 keeps
        // one slot free so the applier can always make progress while every
        // copy thread is busy.
        let db_config = DbConfig {
            lock_wait_timeout: self.migration.lock_wait_timeout,
            max_open_connections: (self.migration.threads + 1) as u32,
            force_kill: self.migration.force_kill,
        };
        let database = self.factory.connect(&self.migration.dsn(), &db_config).await?;
        *self.db.write() = Some(Arc::clone(&database));

        let mut metadata_lock = None;
        let mut lock_db: Option<Arc<dyn Database>> = None;
        if !self.migration.multi() {
            let first = self.first_change()?;
            // CREATE, DROP, and RENAME are single-shot; apply and return.
            if !first.stmt.is_alter_table() {
                database.exec_raw(&first.stmt.statement).await?;
                info!("apply complete");
                return Ok(());
            }
            let table = Arc::new(TableInfo::new(
                first.stmt.schema.clone(),
                first.stmt.table.clone(),
            ));
            table.set_info(database.as_ref()).await?;
            first.set_table(table);

            // Held for the rest of the run so a second migration cannot
            // target the same table concurrently. The lock lives on its own
            // connection: parking it in the shared pool would permanently
            // occupy the slot reserved for the replication applier.
            let lock_pool = self
                .factory
                .connect(
                    &self.migration.dsn(),
                    &DbConfig {
                        lock_wait_timeout: self.migration.lock_wait_timeout,
                        max_open_connections: 1,
                        force_kill: false,
                    },
                )
                .await?;
            metadata_lock = Some(
                MetadataLock::acquire(
                    lock_pool.as_ref(),
                    &first.stmt.schema,
                    &first.stmt.table,
                    self.migration.lock_wait_timeout,
                )
                .await?,
            );
            lock_db = Some(lock_pool);

            match first.attempt_mysql_ddl(database.as_ref()).await {
                Ok(used) => {
                    match used {
                        FastPathDdl::Instant => {
                            self.used_instant_ddl.store(true, Ordering::Release)
                        }
                        FastPathDdl::Inplace => {
                            self.used_inplace_ddl.store(true, Ordering::Release)
                        }
                    }
                    info!(
                        instant_ddl = self.used_instant_ddl(),
                        inplace_ddl = self.used_inplace_ddl(),
                        "apply complete"
                    );
                    release_metadata_lock(metadata_lock.take(), lock_db.take()).await;
                    return Ok(());
                }
                Err(MigrationError::DdlNotSupported(reason)) => {
                    debug!(%reason, "native DDL unavailable, falling back to copy");
                }
                Err(e) => return Err(e),
            }
        } else {
            // Multi-statement migrations never try native DDL; just resolve
            // each table.
            for change in &self.changes {
                let table = Arc::new(TableInfo::new(
                    change.stmt.schema.clone(),
                    change.stmt.table.clone(),
                ));
                table.set_info(database.as_ref()).await?;
                change.set_table(table);
            }
        }

        self.run_checks(CheckScope::Preflight).await?;
        self.setup().await?;

        // A UNIQUE addition cannot be told apart from duplicate-key noise in
        // the replay stream, so verification is not optional.
        if !self.checksum_enabled() && self.contains_unique_index_change() {
            warn!("force enabling checksum: the change adds a UNIQUE index");
            self.checksum_enabled.store(true, Ordering::Release);
        }
        // Visibility changes only reach here after native DDL refused them,
        // which means they are combined with unsafe operations.
        for change in &self.changes {
            if change.stmt.contains_index_visibility() {
                return Err(MigrationError::Unsupported(
                    "ALTER INDEX VISIBLE/INVISIBLE cannot be combined with a copying migration"
                        .into(),
                ));
            }
        }

        self.run_checks(CheckScope::PostSetup).await?;

        {
            let runner = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { runner.dump_status(shutdown).await });
        }
        if !self.migration.multi() {
            let runner = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { runner.dump_checkpoint_continuously(shutdown).await });
        }

        self.state.set(Stage::CopyRows);
        self.copier_handle()?.run().await?;
        info!("copy rows complete");
        // Every event from here on must reach the shadow table; the copier
        // is no longer coming back for keys above its old frontier.
        self.repl_handle()?.set_key_above_watermark_optimization(false);

        // Waits even when defer_cutover is off: the operator may have
        // created the sentinel after the migration started.
        *self.sentinel_wait_start.write() = Some(Instant::now());
        self.state.set(Stage::WaitingOnSentinelTable);
        self.wait_on_sentinel_table().await?;

        self.prepare_for_cutover().await?;
        self.run_checks(CheckScope::Cutover).await?;

        self.state.set(Stage::CutOver);
        let mut targets = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            targets.push(CutoverTarget {
                table: change
                    .table()
                    .ok_or_else(|| MigrationError::Config("table is not resolved".into()))?,
                new_table: change
                    .new_table()
                    .ok_or_else(|| MigrationError::Config("shadow table is not resolved".into()))?,
                old_table_name: change.old_table_name(),
            });
        }
        let cutover = CutOver::new(
            Arc::clone(&database),
            targets,
            self.repl_handle()?,
            self.migration.lock_wait_timeout,
        )?;
        // Make room for the rename; a leftover _old table would block it.
        for change in &self.changes {
            change.drop_old_table(database.as_ref()).await?;
        }
        cutover.run().await?;

        if !self.migration.skip_drop_after_cutover {
            for change in &self.changes {
                match change.drop_old_table(database.as_ref()).await {
                    Ok(()) => info!(table = %change.old_table_name(), "dropped old table"),
                    // The rename already happened; failing the run now would
                    // make automation retry a finished migration.
                    Err(e) => error!(
                        table = %change.old_table_name(),
                        error = %e,
                        "migration successful but failed to drop old table"
                    ),
                }
            }
        } else {
            info!("skipped dropping old table");
        }

        let checksum_time = self
            .checker
            .lock()
            .checker
            .as_ref()
            .map(|c| c.exec_time())
            .unwrap_or_default();
        let copied_chunks = self
            .copy_chunker
            .read()
            .as_ref()
            .map(|c| c.progress().chunks_copied)
            .unwrap_or_default();
        let copy_time = self
            .copier
            .read()
            .as_ref()
            .map(|c| c.exec_time())
            .unwrap_or_default();
        let total_time = self
            .start_time
            .read()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        info!(
            instant_ddl = self.used_instant_ddl(),
            inplace_ddl = self.used_inplace_ddl(),
            total_chunks = copied_chunks,
            copy_rows_time = ?copy_time,
            checksum_time = ?checksum_time,
            total_time = ?total_time,
            conns_in_use = database.in_use(),
            "apply complete"
        );

        if !self.migration.multi() {
            for change in &self.changes {
                change.cleanup(database.as_ref()).await?;
            }
        }
        release_metadata_lock(metadata_lock, lock_db).await;
        Ok(())
    }

    /// Release every resource the run opened and mark the register closed.
    pub async fn close(&self) {
        self.state.set(Stage::Close);
        let _ = self.shutdown.send(());
        if let Some(repl) = self.repl_client.read().clone() {
            repl.close();
        }
        if let Some(throttler) = self.throttler.read().clone() {
            if let Err(e) = throttler.close().await {
                warn!(error = %e, "failed to close throttler");
            }
        }
        if let Some(replica) = self.replica.read().clone() {
            replica.close().await;
        }
        if let Some(database) = self.db.read().clone() {
            database.close().await;
        }
    }

    // -----------------------------------------------------------------------
    // Setup and resume
    // -----------------------------------------------------------------------

    async fn setup(self: &Arc<Self>) -> Result<()> {
        let database = self.db_handle()?;
        // A stale _old table from an abandoned run would block cutover.
        for change in &self.changes {
            change.drop_old_table(database.as_ref()).await?;
        }

        let (ddl_tx, ddl_rx) = mpsc::channel(1);

        match self.resume_from_checkpoint(&database, ddl_tx.clone()).await {
            Ok(()) => {}
            Err(ResumeError::Mismatched) if self.migration.strict => {
                return Err(MigrationError::MismatchedAlter);
            }
            Err(ResumeError::Impossible(reason)) => {
                return Err(MigrationError::ResumeImpossible(reason));
            }
            Err(e) => {
                info!(reason = %e, "could not resume from checkpoint, starting fresh");
                self.fresh_setup(&database, ddl_tx).await?;
            }
        }

        // A replica throttler that cannot be built is fatal: the user asked
        // for lag protection and must not run without it.
        if let Some(replica_dsn) = self.migration.replica_dsn.clone() {
            let replica_config = DbConfig {
                lock_wait_timeout: self.migration.lock_wait_timeout,
                max_open_connections: 2,
                force_kill: false,
            };
            let replica = self.factory.connect(&replica_dsn, &replica_config).await?;
            *self.replica.write() = Some(Arc::clone(&replica));
            let throttler = self
                .factory
                .new_replica_throttler(replica, self.migration.replica_max_lag)
                .await
                .map_err(|e| {
                    warn!(error = %e, "could not create replication throttler");
                    e
                })?;
            self.copier_handle()?.set_throttler(Arc::clone(&throttler));
            throttler.open().await?;
            *self.throttler.write() = Some(throttler);
        }

        let repl = self.repl_handle()?;
        repl.set_key_above_watermark_optimization(true);

        for change in &self.changes {
            if let Some(table) = change.table() {
                let database = Arc::clone(&database);
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(table.auto_update_statistics(
                    database,
                    TABLE_STAT_UPDATE_INTERVAL,
                    shutdown,
                ));
            }
        }
        {
            let repl = Arc::clone(&repl);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                repl.periodic_flush(DEFAULT_FLUSH_INTERVAL, shutdown).await;
            });
        }
        {
            let runner = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { runner.table_change_notification(ddl_rx, shutdown).await });
        }
        Ok(())
    }

    async fn fresh_setup(
        &self,
        database: &Arc<dyn Database>,
        ddl_tx: mpsc::Sender<String>,
    ) -> Result<()> {
        let mut chunkers: Vec<Arc<dyn Chunker>> = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            change.create_new_table(database.as_ref()).await?;
            change.alter_new_table(database.as_ref()).await?;
            let chunker = self
                .factory
                .new_chunker(
                    change
                        .table()
                        .ok_or_else(|| MigrationError::Config("table is not resolved".into()))?,
                    change.new_table().ok_or_else(|| {
                        MigrationError::Config("shadow table is not resolved".into())
                    })?,
                    self.migration.target_chunk_time,
                )
                .await?;
            chunker.open().await?;
            chunkers.push(chunker);
        }

        self.create_checkpoint_table(database).await?;
        if self.migration.defer_cutover {
            self.create_sentinel_table(database).await?;
        }

        let copy_chunker = if self.migration.multi() {
            self.factory.new_multi_chunker(chunkers)
        } else {
            chunkers.remove(0)
        };
        *self.copy_chunker.write() = Some(Arc::clone(&copy_chunker));

        let copier = self
            .factory
            .new_copier(Arc::clone(database), copy_chunker, self.copier_config())
            .await?;
        *self.copier.write() = Some(Arc::clone(&copier));

        let repl = self
            .factory
            .new_repl_client(Arc::clone(database), self.repl_config(ddl_tx));
        for change in &self.changes {
            let source = change
                .table()
                .ok_or_else(|| MigrationError::Config("table is not resolved".into()))?;
            let shadow = change
                .new_table()
                .ok_or_else(|| MigrationError::Config("shadow table is not resolved".into()))?;
            repl.add_subscription(source, shadow, watermark_gate(&copier))?;
        }
        repl.run().await?;
        *self.repl_client.write() = Some(repl);
        Ok(())
    }

    async fn resume_from_checkpoint(
        &self,
        database: &Arc<dyn Database>,
        ddl_tx: mpsc::Sender<String>,
    ) -> std::result::Result<(), ResumeError> {
        if self.migration.multi() {
            return Err(ResumeError::Fallback(
                "resume from checkpoint is not supported for multi-statement migrations".into(),
            ));
        }
        let change = &self.changes[0];
        let new_name = change.new_table_name();
        let cp_name = change.checkpoint_table_name();

        db::exec(
            database.as_ref(),
            "SELECT * FROM %n.%n LIMIT 1",
            &[ident(change.stmt.schema.clone()), ident(new_name.clone())],
        )
        .await
        .map_err(|_| ResumeError::Fallback(format!("shadow table '{new_name}' is missing")))?;

        let rows = db::query(
            database.as_ref(),
            "SELECT * FROM %n.%n ORDER BY id DESC LIMIT 1",
            &[ident(change.stmt.schema.clone()), ident(cp_name.clone())],
        )
        .await
        .map_err(|e| {
            ResumeError::Fallback(format!("could not read from table '{cp_name}': {e}"))
        })?;
        let row = rows.first().ok_or_else(|| {
            ResumeError::Fallback(format!("no checkpoints found in table '{cp_name}'"))
        })?;
        let checkpoint = CheckpointRow::decode(row).map_err(ResumeError::Fallback)?;
        if checkpoint.alter_statement != change.stmt.alter {
            return Err(ResumeError::Mismatched);
        }

        let new_table = Arc::new(TableInfo::new(change.stmt.schema.clone(), new_name));
        new_table
            .set_info(database.as_ref())
            .await
            .map_err(|e| ResumeError::Fallback(e.to_string()))?;
        change.set_new_table(Arc::clone(&new_table));

        // Replayed chunks tolerate duplicate keys, which masks real
        // duplicates; only a checksum can tell them apart.
        self.checksum_enabled.store(true, Ordering::Release);
        *self.checksum_watermark.lock() = if checkpoint.checksum_watermark.is_empty() {
            None
        } else {
            Some(checkpoint.checksum_watermark.clone())
        };

        let source = change
            .table()
            .ok_or_else(|| ResumeError::Fallback("table is not resolved".into()))?;
        let chunker = self
            .factory
            .new_chunker(
                Arc::clone(&source),
                Arc::clone(&new_table),
                self.migration.target_chunk_time,
            )
            .await
            .map_err(|e| ResumeError::Fallback(e.to_string()))?;
        chunker
            .open_at_watermark(
                &checkpoint.copier_watermark,
                source.max_value(),
                checkpoint.rows_copied,
            )
            .await
            .map_err(|e| ResumeError::Fallback(e.to_string()))?;
        *self.copy_chunker.write() = Some(Arc::clone(&chunker));

        let copier = self
            .factory
            .new_copier(Arc::clone(database), chunker, self.copier_config())
            .await
            .map_err(|e| ResumeError::Fallback(e.to_string()))?;
        *self.copier.write() = Some(Arc::clone(&copier));

        let repl = self
            .factory
            .new_repl_client(Arc::clone(database), self.repl_config(ddl_tx));
        repl.add_subscription(source, new_table, watermark_gate(&copier))
            .map_err(|e| ResumeError::Fallback(e.to_string()))?;
        repl.set_flushed_pos(BinlogPosition {
            name: checkpoint.binlog_name.clone(),
            pos: checkpoint.binlog_pos,
        });
        *self.checkpoint_table.write() = Some(Arc::new(TableInfo::new(
            change.stmt.schema.clone(),
            cp_name,
        )));

        // If the checkpoint is so old the binlog file is gone, streaming
        // fails here and the checkpoint is unusable.
        if let Err(e) = repl.run().await {
            warn!(
                log_file = %checkpoint.binlog_name,
                log_pos = checkpoint.binlog_pos,
                "replication could not restart from the checkpoint position"
            );
            return Err(ResumeError::Impossible(e.to_string()));
        }
        *self.repl_client.write() = Some(repl);

        warn!(
            copier_watermark = %checkpoint.copier_watermark,
            checksum_watermark = %checkpoint.checksum_watermark,
            log_file = %checkpoint.binlog_name,
            log_pos = checkpoint.binlog_pos,
            rows_copied = checkpoint.rows_copied,
            "resuming from checkpoint"
        );
        self.used_resume_from_checkpoint.store(true, Ordering::Release);
        Ok(())
    }

    fn copier_config(&self) -> CopierConfig {
        CopierConfig {
            concurrency: self.migration.threads,
            target_chunk_time: self.migration.target_chunk_time,
            final_checksum: self.checksum_enabled(),
            throttler: Arc::new(NoopThrottler),
            metrics: Arc::clone(&self.metrics),
        }
    }

    fn repl_config(&self, ddl_tx: mpsc::Sender<String>) -> ReplClientConfig {
        ReplClientConfig {
            host: self.migration.host.clone(),
            username: self.migration.username.clone(),
            password: self.migration.password.clone(),
            concurrency: self.migration.threads,
            target_batch_time: self.migration.target_chunk_time,
            on_ddl: Some(ddl_tx),
            server_id: None,
        }
    }

    // -----------------------------------------------------------------------
    // Auxiliary tables
    // -----------------------------------------------------------------------

    async fn create_checkpoint_table(&self, database: &Arc<dyn Database>) -> Result<()> {
        if self.migration.multi() {
            return Ok(());
        }
        let change = self.first_change()?;
        let cp_name = change.checkpoint_table_name();
        db::exec(
            database.as_ref(),
            "DROP TABLE IF EXISTS %n.%n",
            &[ident(change.stmt.schema.clone()), ident(cp_name.clone())],
        )
        .await?;
        db::exec(
            database.as_ref(),
            "CREATE TABLE %n.%n (\
             id int NOT NULL AUTO_INCREMENT PRIMARY KEY, \
             copier_watermark TEXT, \
             checksum_watermark TEXT, \
             binlog_name VARCHAR(255), \
             binlog_pos INT, \
             rows_copied BIGINT, \
             alter_statement TEXT)",
            &[ident(change.stmt.schema.clone()), ident(cp_name.clone())],
        )
        .await?;
        *self.checkpoint_table.write() = Some(Arc::new(TableInfo::new(
            change.stmt.schema.clone(),
            cp_name,
        )));
        Ok(())
    }

    async fn create_sentinel_table(&self, database: &Arc<dyn Database>) -> Result<()> {
        let change = self.first_change()?;
        db::exec(
            database.as_ref(),
            "DROP TABLE IF EXISTS %n.%n",
            &[
                ident(change.stmt.schema.clone()),
                ident(SENTINEL_TABLE_NAME),
            ],
        )
        .await?;
        db::exec(
            database.as_ref(),
            "CREATE TABLE %n.%n (id int NOT NULL PRIMARY KEY)",
            &[
                ident(change.stmt.schema.clone()),
                ident(SENTINEL_TABLE_NAME),
            ],
        )
        .await?;
        Ok(())
    }

    async fn drop_checkpoint(&self, database: &Arc<dyn Database>) -> Result<()> {
        if self.migration.multi() {
            return Ok(());
        }
        let Some(checkpoint) = self.checkpoint_table.read().clone() else {
            return Ok(());
        };
        db::exec(
            database.as_ref(),
            "DROP TABLE IF EXISTS %n.%n",
            &[
                ident(checkpoint.schema_name.clone()),
                ident(checkpoint.table_name.clone()),
            ],
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sentinel gate
    // -----------------------------------------------------------------------

    async fn sentinel_table_exists(&self, database: &Arc<dyn Database>) -> Result<bool> {
        let change = self.first_change()?;
        let rows = db::query(
            database.as_ref(),
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = %? AND table_name = %?",
            &[
                Param::Str(change.stmt.schema.clone()),
                Param::Str(SENTINEL_TABLE_NAME.to_string()),
            ],
        )
        .await?;
        let count = rows
            .first()
            .and_then(|r| r.values.first())
            .and_then(SqlValue::as_i64)
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn wait_on_sentinel_table(&self) -> Result<()> {
        if self.migration.multi() {
            return Ok(());
        }
        let database = self.db_handle()?;
        if !self.sentinel_table_exists(&database).await? {
            return Ok(());
        }
        warn!(
            sentinel = SENTINEL_TABLE_NAME,
            wait_limit = ?SENTINEL_WAIT_LIMIT,
            "cutover deferred while sentinel table exists"
        );
        let timeout = tokio::time::sleep(SENTINEL_WAIT_LIMIT);
        tokio::pin!(timeout);
        let mut ticker = tokio::time::interval(SENTINEL_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = &mut timeout => return Err(MigrationError::SentinelTimeout),
                _ = ticker.tick() => {
                    if !self.sentinel_table_exists(&database).await? {
                        info!("sentinel table dropped, proceeding to cutover");
                        return Ok(());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cutover preparation and checksum
    // -----------------------------------------------------------------------

    async fn prepare_for_cutover(&self) -> Result<()> {
        self.state.set(Stage::ApplyChangeset);
        let repl = self.repl_handle()?;
        // Periodic flushing stops here so ANALYZE and the cutover lock do
        // not contend with batch applies; the checksum flushes on its own.
        repl.stop_periodic_flush();
        repl.flush().await?;

        self.state.set(Stage::AnalyzeTable);
        info!("running ANALYZE TABLE");
        let database = self.db_handle()?;
        for change in &self.changes {
            let new_table = change
                .new_table()
                .ok_or_else(|| MigrationError::Config("shadow table is not resolved".into()))?;
            db::exec(
                database.as_ref(),
                "ANALYZE TABLE %n.%n",
                &[
                    ident(new_table.schema_name.clone()),
                    ident(new_table.table_name.clone()),
                ],
            )
            .await?;
            // The checksum reads a consistent snapshot and never sees rows
            // newer than it, while chunking through ranges with long undo
            // history degrades quadratically. Freeze the statistics so the
            // planner is not re-targeted mid-verification.
            if let Some(table) = change.table() {
                table.disable_auto_update_statistics();
            }
        }

        if self.checksum_enabled() {
            self.checksum().await?;
        }
        Ok(())
    }

    async fn init_checksum_chunker(&self) -> Result<()> {
        if !self.migration.multi() {
            let change = self.first_change()?;
            let source = change
                .table()
                .ok_or_else(|| MigrationError::Config("table is not resolved".into()))?;
            let shadow = change
                .new_table()
                .ok_or_else(|| MigrationError::Config("shadow table is not resolved".into()))?;
            let chunker = self
                .factory
                .new_chunker(source, Arc::clone(&shadow), self.migration.target_chunk_time)
                .await?;
            let watermark = self.checksum_watermark.lock().clone();
            match watermark {
                Some(w) => {
                    chunker
                        .open_at_watermark(&w, shadow.max_value(), 0)
                        .await?
                }
                None => chunker.open().await?,
            }
            self.checker.lock().chunker = Some(chunker);
            return Ok(());
        }
        // Multi-table verification starts fresh; it is not resumable.
        let mut parts: Vec<Arc<dyn Chunker>> = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let source = change
                .table()
                .ok_or_else(|| MigrationError::Config("table is not resolved".into()))?;
            let shadow = change
                .new_table()
                .ok_or_else(|| MigrationError::Config("shadow table is not resolved".into()))?;
            let chunker = self
                .factory
                .new_chunker(source, shadow, self.migration.target_chunk_time)
                .await?;
            chunker.open().await?;
            parts.push(chunker);
        }
        self.checker.lock().chunker = Some(self.factory.new_multi_chunker(parts));
        Ok(())
    }

    async fn checksum(&self) -> Result<()> {
        self.state.set(Stage::Checksum);
        let database = self.db_handle()?;
        // The checker holds read-view connections on top of the repair
        // writes, so the pool gets one more slot than the copy phase had.
        database.set_max_connections((self.migration.threads + 2) as u32);

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                // A failed pass may have repaired rows below the watermark;
                // the next pass must start over.
                *self.checksum_watermark.lock() = None;
            }
            self.init_checksum_chunker().await?;
            let chunker = self
                .checker
                .lock()
                .chunker
                .clone()
                .ok_or_else(|| MigrationError::Config("checksum chunker is not open".into()))?;
            let checker = self
                .factory
                .new_checker(
                    Arc::clone(&database),
                    chunker,
                    self.repl_handle()?,
                    CheckerConfig {
                        concurrency: self.migration.threads,
                        target_chunk_time: self.migration.target_chunk_time,
                        fix_differences: true,
                    },
                )
                .await?;
            self.checker.lock().checker = Some(Arc::clone(&checker));
            checker.run().await?;
            if checker.differences_found() == 0 {
                break;
            }
            if attempt >= CHECKSUM_ATTEMPTS {
                return Err(MigrationError::ChecksumFailed {
                    attempts: CHECKSUM_ATTEMPTS,
                    likely_lossy: self.contains_unique_index_change(),
                });
            }
            error!(
                attempt,
                max_attempts = CHECKSUM_ATTEMPTS,
                differences = checker.differences_found(),
                "checksum found differences, retrying"
            );
        }
        info!("checksum passed");

        // A long checksum grows the delta buffer; drain it before cutover
        // checks begin.
        self.state.set(Stage::PostChecksum);
        self.repl_handle()?.flush().await?;
        Ok(())
    }

    fn contains_unique_index_change(&self) -> bool {
        self.changes.iter().any(|c| c.stmt.contains_add_unique())
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn dump_checkpoint(&self) -> Result<()> {
        let database = self.db_handle()?;
        let repl = self.repl_handle()?;
        let chunker = self.copy_chunker_handle()?;
        let checkpoint = self
            .checkpoint_table
            .read()
            .clone()
            .ok_or_else(|| MigrationError::Config("checkpoint table is not created".into()))?;

        let binlog = repl.get_binlog_apply_position();
        // Not available until the first chunk completes; the next tick
        // will retry.
        let copier_watermark = chunker.get_low_watermark()?;
        let mut checksum_watermark = String::new();
        if self.state.get() >= Stage::Checksum {
            let guard = self.checker.lock();
            if guard.checker.is_some() {
                if let Some(checksum_chunker) = &guard.chunker {
                    checksum_watermark = checksum_chunker.get_low_watermark()?;
                }
            }
        }
        let rows_copied = chunker.progress().rows_copied;
        let alter = self.first_change()?.stmt.alter.clone();

        info!(
            low_watermark = %copier_watermark,
            log_file = %binlog.name,
            log_pos = binlog.pos,
            rows_copied,
            "checkpoint"
        );
        db::exec(
            database.as_ref(),
            "INSERT INTO %n.%n (copier_watermark, checksum_watermark, binlog_name, \
             binlog_pos, rows_copied, alter_statement) VALUES (%?, %?, %?, %?, %?, %?)",
            &[
                ident(checkpoint.schema_name.clone()),
                ident(checkpoint.table_name.clone()),
                Param::Str(copier_watermark),
                Param::Str(checksum_watermark),
                Param::Str(binlog.name),
                Param::UInt(u64::from(binlog.pos)),
                Param::UInt(rows_copied),
                Param::Str(alter),
            ],
        )
        .await?;
        Ok(())
    }

    async fn dump_checkpoint_continuously(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(CHECKPOINT_DUMP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if self.state.get() >= Stage::CutOver {
                        return;
                    }
                    if let Err(e) = self.dump_checkpoint().await {
                        error!(error = %e, "error writing checkpoint");
                    }
                }
            }
        }
    }

    async fn dump_status(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if !self.log_status() {
                        return;
                    }
                }
            }
        }
    }

    // One status line, shape depending on the stage. Returns false once the
    // lifecycle has moved past cutover.
    fn log_status(&self) -> bool {
        let state = self.state.get();
        if state > Stage::CutOver {
            return false;
        }
        let total_time = self
            .start_time
            .read()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let conns_in_use = self.db.read().as_ref().map(|d| d.in_use()).unwrap_or(0);
        match state {
            Stage::CopyRows => {
                let (Ok(copier), Ok(repl)) = (self.copier_handle(), self.repl_handle()) else {
                    return true;
                };
                let copy_time = copier
                    .start_time()
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                info!(
                    state = %state,
                    copy_progress = %copier.get_progress(),
                    binlog_deltas = repl.get_delta_len(),
                    total_time = ?total_time,
                    copier_time = ?copy_time,
                    copier_remaining_time = %copier.get_eta(),
                    copier_is_throttled = copier.is_throttled(),
                    conns_in_use,
                    "migration status"
                );
            }
            Stage::WaitingOnSentinelTable => {
                let wait_time = self
                    .sentinel_wait_start
                    .read()
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                let schema = self
                    .changes
                    .first()
                    .map(|c| c.stmt.schema.clone())
                    .unwrap_or_default();
                info!(
                    state = %state,
                    sentinel_table = %format!("{schema}.{SENTINEL_TABLE_NAME}"),
                    total_time = ?total_time,
                    sentinel_wait_time = ?wait_time,
                    sentinel_max_wait_time = ?SENTINEL_WAIT_LIMIT,
                    conns_in_use,
                    "migration status"
                );
            }
            Stage::ApplyChangeset | Stage::PostChecksum => {
                let Ok(repl) = self.repl_handle() else {
                    return true;
                };
                info!(
                    state = %state,
                    binlog_deltas = repl.get_delta_len(),
                    total_time = ?total_time,
                    conns_in_use,
                    "migration status"
                );
            }
            Stage::Checksum => {
                let guard = self.checker.lock();
                let deltas = self
                    .repl_client
                    .read()
                    .as_ref()
                    .map(|r| r.get_delta_len())
                    .unwrap_or(0);
                match &guard.checker {
                    Some(checker) => {
                        let checksum_time = checker
                            .start_time()
                            .map(|t| t.elapsed())
                            .unwrap_or_default();
                        info!(
                            state = %state,
                            checksum_progress = %checker.get_progress(),
                            binlog_deltas = deltas,
                            total_time = ?total_time,
                            checksum_time = ?checksum_time,
                            conns_in_use,
                            "migration status"
                        );
                    }
                    None => info!(
                        state = %state,
                        checksum_progress = "initializing",
                        binlog_deltas = deltas,
                        total_time = ?total_time,
                        conns_in_use,
                        "migration status"
                    ),
                }
            }
            _ => {}
        }
        true
    }

    /// Snapshot of the current stage and a human-readable summary.
    pub fn get_progress(&self) -> Progress {
        let state = self.state.get();
        let summary = match state {
            Stage::CopyRows => self
                .copier
                .read()
                .as_ref()
                .map(|c| format!("{} {} ETA {}", c.get_progress(), state, c.get_eta()))
                .unwrap_or_default(),
            Stage::WaitingOnSentinelTable => "Waiting on Sentinel Table".to_string(),
            Stage::ApplyChangeset | Stage::PostChecksum => {
                let deltas = self
                    .repl_client
                    .read()
                    .as_ref()
                    .map(|r| r.get_delta_len())
                    .unwrap_or(0);
                format!("Applying Changeset Deltas={deltas}")
            }
            Stage::Checksum => {
                let guard = self.checker.lock();
                match &guard.checker {
                    Some(checker) => format!("Checksum Progress={}", checker.get_progress()),
                    None => "Checksum Progress=initializing".to_string(),
                }
            }
            _ => String::new(),
        };
        Progress {
            current_state: state.to_string(),
            summary,
            started_at: *self.started_at.read(),
        }
    }

    // Sole consumer of the replication client's DDL notifications. A schema
    // change to either subject table makes the migration unrecoverable: the
    // checkpoint is invalidated and the task panics so supervision restarts
    // the process cleanly.
    async fn table_change_notification(
        self: Arc<Self>,
        mut ddl_rx: mpsc::Receiver<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if self.migration.multi() {
            return;
        }
        let Some(change) = self.changes.first() else {
            return;
        };
        let (Some(table), Some(new_table)) = (change.table(), change.new_table()) else {
            return;
        };
        let table_encoded = encode_schema_table(&table.schema_name, &table.table_name);
        let new_table_encoded = encode_schema_table(&new_table.schema_name, &new_table.table_name);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = ddl_rx.recv() => {
                    let Some(subject) = event else { break };
                    if self.state.get() >= Stage::CutOver {
                        break;
                    }
                    if subject == table_encoded || subject == new_table_encoded {
                        self.state.set(Stage::ErrCleanup);
                        error!(table = %subject, "table definition changed during migration");
                        // A diverged schema can never be resumed against;
                        // the next attempt must start fresh.
                        match self.db_handle() {
                            Ok(database) => {
                                if let Err(e) = self.drop_checkpoint(&database).await {
                                    error!(error = %e, "could not remove checkpoint");
                                }
                            }
                            Err(e) => error!(error = %e, "could not remove checkpoint"),
                        }
                        panic!("table definition of {subject} changed during migration");
                    }
                }
            }
        }
        if let Ok(repl) = self.repl_handle() {
            repl.set_ddl_notification(None);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn run_checks(&self, scope: CheckScope) -> Result<()> {
        let runner = self.factory.check_runner();
        for change in &self.changes {
            let resources = CheckResources {
                db: self.db_handle()?,
                replica: self.replica.read().clone(),
                table: change.table(),
                statement: change.stmt.clone(),
                target_chunk_time: self.migration.target_chunk_time,
                threads: self.migration.threads,
                replica_max_lag: self.migration.replica_max_lag,
                force_kill: self.migration.force_kill,
                host: self.migration.host.clone(),
                username: self.migration.username.clone(),
                password: self.migration.password.clone(),
                skip_drop_after_cutover: self.migration.skip_drop_after_cutover,
            };
            runner.run_checks(&resources, scope).await?;
        }
        Ok(())
    }

    fn first_change(&self) -> Result<&Change> {
        self.changes
            .first()
            .ok_or_else(|| MigrationError::Config("no statements".into()))
    }

    fn db_handle(&self) -> Result<Arc<dyn Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| MigrationError::Config("database is not connected".into()))
    }

    fn copier_handle(&self) -> Result<Arc<dyn Copier>> {
        self.copier
            .read()
            .clone()
            .ok_or_else(|| MigrationError::Config("copier is not created".into()))
    }

    fn repl_handle(&self) -> Result<Arc<dyn ReplClient>> {
        self.repl_client
            .read()
            .clone()
            .ok_or_else(|| MigrationError::Config("replication client is not created".into()))
    }

    fn copy_chunker_handle(&self) -> Result<Arc<dyn Chunker>> {
        self.copy_chunker
            .read()
            .clone()
            .ok_or_else(|| MigrationError::Config("chunker is not created".into()))
    }
}

fn watermark_gate(copier: &Arc<dyn Copier>) -> WatermarkGate {
    let copier = Arc::clone(copier);
    Arc::new(move |key| copier.key_above_high_watermark(key))
}

// On error paths both are simply dropped instead: closing the lock's
// connection releases the server-side lock.
async fn release_metadata_lock(lock: Option<MetadataLock>, pool: Option<Arc<dyn Database>>) {
    if let Some(lock) = lock {
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release metadata lock");
        }
    }
    if let Some(pool) = pool {
        pool.close().await;
    }
}
