//! Table descriptors and the chunk-planning interface.
//!
//! [`TableInfo`] is the engine's view of one MySQL table: identity, primary
//! key, key bounds, and a row estimate refreshed in the background while the
//! copy runs. Chunk planning itself (splitting the key space into ranges
//! sized to a time budget) is the chunker's job and is consumed through the
//! [`Chunker`] trait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::db::{self, ident, Database, DbError, Param, SqlValue};

/// An ordered key value from a table's primary or unique key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    /// Signed integer key.
    Int(i64),
    /// Unsigned integer key.
    UInt(u64),
    /// String key.
    Text(String),
    /// Composite key, one datum per key column.
    Composite(Vec<Datum>),
}

impl Datum {
    fn from_sql(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Int(v) => Some(Datum::Int(*v)),
            SqlValue::UInt(v) => Some(Datum::UInt(*v)),
            SqlValue::Text(s) => Some(Datum::Text(s.clone())),
            SqlValue::Bytes(_) | SqlValue::Null => None,
        }
    }
}

/// Errors from chunk planning.
#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    /// The low watermark is not established yet (no chunk has completed).
    #[error("low watermark is not available yet")]
    WatermarkUnavailable,
    /// A stored watermark could not be interpreted.
    #[error("invalid watermark: {0}")]
    InvalidWatermark(String),
    /// The chunker was used before `open`.
    #[error("chunker is not open")]
    NotOpen,
    /// Database failure during planning.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Implementation-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Copy progress as reported by a chunker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerProgress {
    /// Rows copied so far.
    pub rows_copied: u64,
    /// Chunks completed so far.
    pub chunks_copied: u64,
    /// Estimated total rows in the source range.
    pub total_rows: u64,
}

/// Plans key-range chunks over a source/shadow table pair.
#[async_trait]
pub trait Chunker: Send + Sync {
    /// Open at the start of the key space.
    async fn open(&self) -> Result<(), ChunkerError>;

    /// Open mid-stream at a stored watermark, for crash resume. `high` caps
    /// the range at the source table's maximum key; `rows_copied` seeds the
    /// progress counters.
    async fn open_at_watermark(
        &self,
        watermark: &str,
        high: Option<Datum>,
        rows_copied: u64,
    ) -> Result<(), ChunkerError>;

    /// Serialized key below which every row is known copied and replicated.
    /// Unavailable until the first chunk completes.
    fn get_low_watermark(&self) -> Result<String, ChunkerError>;

    /// Current progress counters.
    fn progress(&self) -> ChunkerProgress;
}

/// Schema, key, and size information for one table.
///
/// Cheap to construct; [`TableInfo::set_info`] fills it from
/// `information_schema`. Shared across workstreams behind an `Arc`, so the
/// mutable parts use interior mutability.
pub struct TableInfo {
    /// Schema the table lives in.
    pub schema_name: String,
    /// Table name.
    pub table_name: String,
    key_columns: RwLock<Vec<String>>,
    min_value: RwLock<Option<Datum>>,
    max_value: RwLock<Option<Datum>>,
    estimated_rows: AtomicU64,
    partitioned: AtomicBool,
    stats_disabled: AtomicBool,
}

impl TableInfo {
    /// Create an unresolved descriptor for `schema`.`table`.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema_name: schema.into(),
            table_name: table.into(),
            key_columns: RwLock::new(Vec::new()),
            min_value: RwLock::new(None),
            max_value: RwLock::new(None),
            estimated_rows: AtomicU64::new(0),
            partitioned: AtomicBool::new(false),
            stats_disabled: AtomicBool::new(false),
        }
    }

    /// Resolve the descriptor against the server: row estimate, partitioning,
    /// primary key columns, and key bounds. Fails if the table does not
    /// exist.
    pub async fn set_info(&self, database: &dyn Database) -> Result<(), DbError> {
        let rows = db::query(
            database,
            "SELECT IFNULL(table_rows, 0), IFNULL(create_options, '') \
             FROM information_schema.tables WHERE table_schema = %? AND table_name = %?",
            &[
                Param::Str(self.schema_name.clone()),
                Param::Str(self.table_name.clone()),
            ],
        )
        .await?;
        let row = rows.first().ok_or_else(|| {
            DbError::Decode(format!(
                "table {}.{} does not exist",
                self.schema_name, self.table_name
            ))
        })?;
        let estimated = row.values.first().and_then(SqlValue::as_u64).unwrap_or(0);
        self.estimated_rows.store(estimated, Ordering::Release);
        let options = row.values.get(1).and_then(SqlValue::as_str).unwrap_or("");
        self.partitioned
            .store(options.contains("partitioned"), Ordering::Release);

        let key_rows = db::query(
            database,
            "SELECT column_name FROM information_schema.key_column_usage \
             WHERE table_schema = %? AND table_name = %? AND constraint_name = 'PRIMARY' \
             ORDER BY ordinal_position",
            &[
                Param::Str(self.schema_name.clone()),
                Param::Str(self.table_name.clone()),
            ],
        )
        .await?;
        let keys: Vec<String> = key_rows
            .iter()
            .filter_map(|r| r.values.first().and_then(SqlValue::as_str))
            .map(str::to_string)
            .collect();
        *self.key_columns.write() = keys.clone();

        // Bounds are only tracked for single-column keys; composite-key
        // bounds are the chunker's problem.
        if let [key] = keys.as_slice() {
            let bounds = db::query(
                database,
                "SELECT MIN(%n), MAX(%n) FROM %n.%n",
                &[
                    ident(key.clone()),
                    ident(key.clone()),
                    ident(self.schema_name.clone()),
                    ident(self.table_name.clone()),
                ],
            )
            .await?;
            if let Some(row) = bounds.first() {
                *self.min_value.write() = row.values.first().and_then(Datum::from_sql);
                *self.max_value.write() = row.values.get(1).and_then(Datum::from_sql);
            }
        }
        Ok(())
    }

    /// Primary key column names, in index order.
    pub fn key_columns(&self) -> Vec<String> {
        self.key_columns.read().clone()
    }

    /// Smallest key value seen at the last statistics refresh.
    pub fn min_value(&self) -> Option<Datum> {
        self.min_value.read().clone()
    }

    /// Largest key value seen at the last statistics refresh.
    pub fn max_value(&self) -> Option<Datum> {
        self.max_value.read().clone()
    }

    /// Server-estimated row count.
    pub fn estimated_rows(&self) -> u64 {
        self.estimated_rows.load(Ordering::Acquire)
    }

    /// Whether the table is partitioned.
    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::Acquire)
    }

    /// Stop the background statistics refresh started by
    /// [`TableInfo::auto_update_statistics`].
    pub fn disable_auto_update_statistics(&self) {
        self.stats_disabled.store(true, Ordering::Release);
    }

    /// Periodically re-resolve the descriptor so chunk sizing tracks table
    /// growth. Runs until disabled or shut down.
    pub async fn auto_update_statistics(
        self: Arc<Self>,
        database: Arc<dyn Database>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if self.stats_disabled.load(Ordering::Acquire) {
                        return;
                    }
                    match self.set_info(database.as_ref()).await {
                        Ok(()) => debug!(
                            table = %self.table_name,
                            estimated_rows = self.estimated_rows(),
                            "table statistics refreshed"
                        ),
                        Err(e) => warn!(
                            table = %self.table_name,
                            error = %e,
                            "table statistics refresh failed"
                        ),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInfo")
            .field("schema_name", &self.schema_name)
            .field("table_name", &self.table_name)
            .field("estimated_rows", &self.estimated_rows())
            .finish()
    }
}
