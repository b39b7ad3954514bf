//! Cutover driver.
//!
//! The final, briefly-blocking step of a migration: with replication fully
//! drained, every source/shadow pair is swapped in a single multi-table
//! `RENAME TABLE`, which MySQL applies atomically. Writes are held off by a
//! `LOCK TABLES ... WRITE` taken on a dedicated session for the duration of
//! the drain and rename.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::db::{quote_ident, Database, DbError};
use crate::repl::ReplClient;
use crate::table::TableInfo;

/// Cutover-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum CutoverError {
    /// Constructed with nothing to rename.
    #[error("cutover requires at least one table pair")]
    NoTables,

    /// Replication deltas remained after the under-lock flush.
    #[error("{0} binlog deltas remained after the final flush")]
    DeltasRemain(usize),

    /// The under-lock flush failed.
    #[error("final replication flush failed: {0}")]
    FlushFailed(String),

    /// Database failure while locking, renaming, or unlocking.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// One source/shadow pair to swap.
pub struct CutoverTarget {
    /// The table being migrated.
    pub table: Arc<TableInfo>,
    /// Its shadow, carrying the post-ALTER schema.
    pub new_table: Arc<TableInfo>,
    /// Name the source is parked under after the swap.
    pub old_table_name: String,
}

/// Executes the locked swap for a set of table pairs.
pub struct CutOver {
    db: Arc<dyn Database>,
    targets: Vec<CutoverTarget>,
    repl: Arc<dyn ReplClient>,
    lock_wait_timeout: Duration,
}

impl CutOver {
    /// Build a cutover over `targets`. Fails if `targets` is empty.
    pub fn new(
        db: Arc<dyn Database>,
        targets: Vec<CutoverTarget>,
        repl: Arc<dyn ReplClient>,
        lock_wait_timeout: Duration,
    ) -> Result<Self, CutoverError> {
        if targets.is_empty() {
            return Err(CutoverError::NoTables);
        }
        Ok(Self {
            db,
            targets,
            repl,
            lock_wait_timeout,
        })
    }

    /// Lock, drain, rename, unlock.
    pub async fn run(&self) -> Result<(), CutoverError> {
        let start = Instant::now();
        let mut session = self.db.session().await?;
        session
            .exec_raw(&format!(
                "SET SESSION lock_wait_timeout = {}",
                self.lock_wait_timeout.as_secs()
            ))
            .await?;

        // Hold writes on every table involved so the delta buffer can reach
        // zero and stay there until the rename lands.
        session.exec_raw(&self.lock_statement()).await?;
        info!(tables = self.targets.len(), "tables locked for cutover");

        let result = self.swap_under_lock(session.as_mut()).await;
        if let Err(e) = session.exec_raw("UNLOCK TABLES").await {
            warn!(error = %e, "failed to unlock tables after cutover");
        }
        result?;

        info!(
            duration = ?start.elapsed(),
            tables = self.targets.len(),
            "cutover complete"
        );
        Ok(())
    }

    // The rename must run on the session holding the table locks; any other
    // connection would queue behind them.
    async fn swap_under_lock(
        &self,
        session: &mut dyn crate::db::DbSession,
    ) -> Result<(), CutoverError> {
        self.repl
            .flush()
            .await
            .map_err(|e| CutoverError::FlushFailed(e.to_string()))?;
        let remaining = self.repl.get_delta_len();
        if remaining > 0 {
            return Err(CutoverError::DeltasRemain(remaining));
        }
        session.exec_raw(&self.rename_statement()).await?;
        Ok(())
    }

    fn lock_statement(&self) -> String {
        let mut parts = Vec::with_capacity(self.targets.len() * 2);
        for t in &self.targets {
            parts.push(format!(
                "{}.{} WRITE",
                quote_ident(&t.table.schema_name),
                quote_ident(&t.table.table_name)
            ));
            parts.push(format!(
                "{}.{} WRITE",
                quote_ident(&t.new_table.schema_name),
                quote_ident(&t.new_table.table_name)
            ));
        }
        format!("LOCK TABLES {}", parts.join(", "))
    }

    fn rename_statement(&self) -> String {
        let mut parts = Vec::with_capacity(self.targets.len() * 2);
        for t in &self.targets {
            let schema = quote_ident(&t.table.schema_name);
            parts.push(format!(
                "{schema}.{} TO {schema}.{}",
                quote_ident(&t.table.table_name),
                quote_ident(&t.old_table_name)
            ));
            parts.push(format!(
                "{schema}.{} TO {schema}.{}",
                quote_ident(&t.new_table.table_name),
                quote_ident(&t.table.table_name)
            ));
        }
        format!("RENAME TABLE {}", parts.join(", "))
    }
}
