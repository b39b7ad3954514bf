//! Binlog replication client interface.
//!
//! The replication client subscribes to row events for the tables under
//! migration, buffers them as deltas keyed by primary key, and applies them
//! to the shadow table in batches. The engine controls flushing, watermark
//! optimization, and DDL notification through this trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::db::DbError;
use crate::table::{Datum, TableInfo};

/// How often the periodic flusher applies buffered deltas.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Gate deciding whether a row event's key is above the copy frontier.
pub type WatermarkGate = Arc<dyn Fn(&Datum) -> bool + Send + Sync>;

/// Encode a schema/table pair the way DDL notifications carry them.
pub fn encode_schema_table(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

/// A binary log position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Log file name.
    pub name: String,
    /// Byte offset within the file.
    pub pos: u32,
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

/// Errors from the replication client.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// The binlog stream could not be started, typically because the
    /// requested position has been purged.
    #[error("could not start replication at {pos}: {reason}")]
    StartFailed {
        /// The position that was requested.
        pos: BinlogPosition,
        /// Server-reported reason.
        reason: String,
    },
    /// Applying deltas to the shadow table failed.
    #[error("delta apply failed: {0}")]
    ApplyFailed(String),
    /// Database failure.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Implementation-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Construction options for a replication client.
#[derive(Clone)]
pub struct ReplClientConfig {
    /// MySQL host to stream from.
    pub host: String,
    /// Replication username.
    pub username: String,
    /// Replication password.
    pub password: String,
    /// Concurrent delta-apply statements.
    pub concurrency: usize,
    /// Time budget for one delta-apply batch.
    pub target_batch_time: Duration,
    /// Channel receiving encoded `schema.table` names for DDL events seen on
    /// the stream.
    pub on_ddl: Option<mpsc::Sender<String>>,
    /// Server id to register with; `None` lets the client pick one.
    pub server_id: Option<u32>,
}

/// Long-lived binlog subscriber and delta applier.
#[async_trait]
pub trait ReplClient: Send + Sync {
    /// Subscribe row events on `source`, applying them to `shadow`. Events
    /// whose key passes `gate` may be skipped while the watermark
    /// optimization is on.
    fn add_subscription(
        &self,
        source: Arc<TableInfo>,
        shadow: Arc<TableInfo>,
        gate: WatermarkGate,
    ) -> Result<(), ReplError>;

    /// Connect and start streaming. Returns once the feed is established.
    async fn run(&self) -> Result<(), ReplError>;

    /// Seed the flushed position when resuming from a checkpoint.
    fn set_flushed_pos(&self, pos: BinlogPosition);

    /// The last position whose events are durably applied to the shadow.
    fn get_binlog_apply_position(&self) -> BinlogPosition;

    /// Toggle skipping of events above the copy frontier. Must be off once
    /// the copier has finished claiming keys.
    fn set_key_above_watermark_optimization(&self, enabled: bool);

    /// Apply buffered deltas on `interval` until
    /// [`ReplClient::stop_periodic_flush`] or shutdown. Intended to be
    /// spawned.
    async fn periodic_flush(&self, interval: Duration, shutdown: tokio::sync::broadcast::Receiver<()>);

    /// Stop the periodic flusher.
    fn stop_periodic_flush(&self);

    /// Synchronously apply deltas until the buffer is empty.
    async fn flush(&self) -> Result<(), ReplError>;

    /// Number of buffered deltas not yet applied.
    fn get_delta_len(&self) -> usize;

    /// Replace or clear the DDL notification channel.
    fn set_ddl_notification(&self, channel: Option<mpsc::Sender<String>>);

    /// Stop streaming and release the connection.
    fn close(&self);
}
