//! Per-statement migration bundle.
//!
//! A [`Change`] ties one parsed statement to its source table, its shadow
//! table (`_<name>_new`), and the `_<name>_old` rename target. The runner
//! owns the changes; table descriptors are filled in as the lifecycle
//! resolves them.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::db::{
    self, quote_ident, Database, DbError, ER_ALTER_OPERATION_NOT_SUPPORTED,
    ER_ALTER_OPERATION_NOT_SUPPORTED_REASON, ER_NOT_SUPPORTED_YET,
};
use crate::statement::Statement;
use crate::table::TableInfo;

use super::{MigrationError, Result};

/// Which server-native DDL algorithm applied a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathDdl {
    /// `ALGORITHM=INSTANT` succeeded.
    Instant,
    /// `ALGORITHM=INPLACE, LOCK=NONE` succeeded.
    Inplace,
}

/// Name of the shadow table for `table`.
pub fn new_table_name(table: &str) -> String {
    format!("_{table}_new")
}

/// Name the source table is renamed to at cutover.
pub fn old_table_name(table: &str) -> String {
    format!("_{table}_old")
}

/// Name of the checkpoint table for `table`.
pub fn checkpoint_table_name(table: &str) -> String {
    format!("_{table}_chkpnt")
}

/// One statement's tables and state within a migration.
pub struct Change {
    /// The parsed statement.
    pub stmt: Statement,
    table: RwLock<Option<Arc<TableInfo>>>,
    new_table: RwLock<Option<Arc<TableInfo>>>,
}

impl Change {
    /// Wrap a parsed statement.
    pub fn new(stmt: Statement) -> Self {
        Self {
            stmt,
            table: RwLock::new(None),
            new_table: RwLock::new(None),
        }
    }

    /// The resolved source table, once set.
    pub fn table(&self) -> Option<Arc<TableInfo>> {
        self.table.read().clone()
    }

    /// The resolved shadow table, once created or re-attached.
    pub fn new_table(&self) -> Option<Arc<TableInfo>> {
        self.new_table.read().clone()
    }

    pub(crate) fn set_table(&self, info: Arc<TableInfo>) {
        *self.table.write() = Some(info);
    }

    pub(crate) fn set_new_table(&self, info: Arc<TableInfo>) {
        *self.new_table.write() = Some(info);
    }

    /// Shadow table name for this change.
    pub fn new_table_name(&self) -> String {
        new_table_name(&self.stmt.table)
    }

    /// Rename target for the source table at cutover.
    pub fn old_table_name(&self) -> String {
        old_table_name(&self.stmt.table)
    }

    /// Checkpoint table name for this change.
    pub fn checkpoint_table_name(&self) -> String {
        checkpoint_table_name(&self.stmt.table)
    }

    /// Try the change with server-native DDL, cheapest algorithm first.
    ///
    /// Success means the migration is complete with no shadow table ever
    /// created. A refusal surfaces as [`MigrationError::DdlNotSupported`]
    /// and the caller falls through to the full copy.
    pub async fn attempt_mysql_ddl(&self, db: &dyn Database) -> Result<FastPathDdl> {
        let table = self
            .table()
            .ok_or_else(|| MigrationError::Config("table info is not resolved".into()))?;
        if table.is_partitioned() {
            return Err(MigrationError::DdlNotSupported(
                "table is partitioned".into(),
            ));
        }
        let base = format!(
            "ALTER TABLE {}.{} {}",
            quote_ident(&self.stmt.schema),
            quote_ident(&self.stmt.table),
            self.stmt.alter
        );
        match db.exec_raw(&format!("{base}, ALGORITHM=INSTANT")).await {
            Ok(_) => return Ok(FastPathDdl::Instant),
            Err(e) if !is_algorithm_refusal(&e) => return Err(e.into()),
            Err(_) => {}
        }
        match db
            .exec_raw(&format!("{base}, ALGORITHM=INPLACE, LOCK=NONE"))
            .await
        {
            Ok(_) => Ok(FastPathDdl::Inplace),
            Err(e) if is_algorithm_refusal(&e) => {
                Err(MigrationError::DdlNotSupported(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the shadow table as a structural clone of the source.
    pub async fn create_new_table(&self, db: &dyn Database) -> Result<()> {
        let new_name = self.new_table_name();
        db::exec(
            db,
            "DROP TABLE IF EXISTS %n.%n",
            &[
                db::ident(self.stmt.schema.clone()),
                db::ident(new_name.clone()),
            ],
        )
        .await?;
        db::exec(
            db,
            "CREATE TABLE %n.%n LIKE %n.%n",
            &[
                db::ident(self.stmt.schema.clone()),
                db::ident(new_name.clone()),
                db::ident(self.stmt.schema.clone()),
                db::ident(self.stmt.table.clone()),
            ],
        )
        .await?;
        let info = Arc::new(TableInfo::new(self.stmt.schema.clone(), new_name));
        info.set_info(db).await?;
        self.set_new_table(info);
        Ok(())
    }

    /// Apply the ALTER to the shadow table.
    pub async fn alter_new_table(&self, db: &dyn Database) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {}.{} {}",
            quote_ident(&self.stmt.schema),
            quote_ident(&self.new_table_name()),
            self.stmt.alter
        );
        db.exec_raw(&sql).await?;
        Ok(())
    }

    /// Drop any `_old` table left behind by an earlier run.
    pub async fn drop_old_table(&self, db: &dyn Database) -> Result<()> {
        db::exec(
            db,
            "DROP TABLE IF EXISTS %n.%n",
            &[
                db::ident(self.stmt.schema.clone()),
                db::ident(self.old_table_name()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Drop this change's checkpoint table after a successful cutover.
    pub async fn cleanup(&self, db: &dyn Database) -> Result<()> {
        db::exec(
            db,
            "DROP TABLE IF EXISTS %n.%n",
            &[
                db::ident(self.stmt.schema.clone()),
                db::ident(self.checkpoint_table_name()),
            ],
        )
        .await?;
        info!(table = %self.stmt.table, "cleanup complete");
        Ok(())
    }
}

fn is_algorithm_refusal(e: &DbError) -> bool {
    matches!(
        e,
        DbError::Server { code, .. } if matches!(
            *code,
            ER_ALTER_OPERATION_NOT_SUPPORTED
                | ER_ALTER_OPERATION_NOT_SUPPORTED_REASON
                | ER_NOT_SUPPORTED_YET
        )
    )
}
