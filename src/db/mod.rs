//! Database access layer.
//!
//! Everything the engine says to MySQL goes through the [`Database`] trait so
//! the migration lifecycle can be exercised against an in-memory double. The
//! production implementation is [`MySqlDatabase`], a thin wrapper over a
//! `sqlx` MySQL pool with session-variable setup, a concurrency cap, and an
//! optional force-kill policy for statements stuck past the lock wait
//! timeout.

pub mod mysql;
pub mod template;

pub use mysql::MySqlDatabase;
pub use template::{ident, quote_ident, Param, TemplateError};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// `ALGORITHM=INSTANT`/`ALGORITHM=INPLACE` was refused by the server.
pub const ER_ALTER_OPERATION_NOT_SUPPORTED: u16 = 1845;
/// `ALGORITHM=...` refused with a reason string.
pub const ER_ALTER_OPERATION_NOT_SUPPORTED_REASON: u16 = 1846;
/// Generic not-supported-yet error, seen from some ALGORITHM combinations.
pub const ER_NOT_SUPPORTED_YET: u16 = 1235;

/// Errors from the database layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Statement assembly failed before reaching the server.
    #[error("sql template error: {0}")]
    Template(#[from] TemplateError),

    /// The server rejected the statement.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    /// A statement exceeded the lock wait timeout and was killed.
    #[error("statement killed after exceeding the lock wait timeout ({0:?})")]
    Killed(Duration),

    /// A metadata lock could not be acquired.
    #[error("could not acquire metadata lock {0}; is another migration running?")]
    LockBusy(String),

    /// A row could not be decoded into the expected shape.
    #[error("row decode error: {0}")]
    Decode(String),

    /// Connection or pool-level failure.
    #[error("connection error: {0}")]
    Connection(String),
}

/// Result alias for database operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Pool configuration applied when a [`Database`] is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Session `lock_wait_timeout` / `innodb_lock_wait_timeout`.
    pub lock_wait_timeout: Duration,
    /// Pool connection cap. The runner sizes this `threads + 1` for the copy
    /// phase and raises it by one more for the checksum.
    pub max_open_connections: u32,
    /// Issue `KILL QUERY` against statements stuck past the lock wait
    /// timeout instead of waiting for the server to resolve them.
    pub force_kill: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(30),
            max_open_connections: 5,
            force_kill: false,
        }
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Signed integer column.
    Int(i64),
    /// Unsigned integer column.
    UInt(u64),
    /// Text column.
    Text(String),
    /// Binary column.
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// The value as a signed integer, coercing unsigned when it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// The value as an unsigned integer, coercing non-negative signed.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::UInt(v) => Some(*v),
            SqlValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// The value as text. NULL decodes to `None`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// A decoded result row: column names plus values, in select order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlRow {
    /// Column names as returned by the server.
    pub columns: Vec<String>,
    /// Values, parallel to `columns`.
    pub values: Vec<SqlValue>,
}

impl SqlRow {
    /// Look up a value by column name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }
}

/// A dedicated connection checked out of the pool.
///
/// Session-scoped state (table locks, user locks, session variables) lives
/// for exactly as long as the session value; dropping it returns or closes
/// the underlying connection, which releases any locks it held.
#[async_trait]
pub trait DbSession: Send {
    /// Execute a statement on this connection; returns affected rows.
    async fn exec_raw(&mut self, sql: &str) -> DbResult<u64>;

    /// Run a query on this connection and decode all rows.
    async fn query_raw(&mut self, sql: &str) -> DbResult<Vec<SqlRow>>;
}

/// A pooled database handle shared by every workstream of a migration.
#[async_trait]
pub trait Database: Send + Sync {
    /// Execute a statement on any pooled connection; returns affected rows.
    async fn exec_raw(&self, sql: &str) -> DbResult<u64>;

    /// Run a query on any pooled connection and decode all rows.
    async fn query_raw(&self, sql: &str) -> DbResult<Vec<SqlRow>>;

    /// Check a dedicated connection out of the pool.
    async fn session(&self) -> DbResult<Box<dyn DbSession>>;

    /// Raise the pool connection cap. Shrinking is not supported.
    fn set_max_connections(&self, max: u32);

    /// Number of connections currently executing.
    fn in_use(&self) -> u32;

    /// Close the pool, waiting for checked-out connections to return.
    async fn close(&self);
}

/// Execute a templated statement. See [`template::build`] for directives.
pub async fn exec(db: &dyn Database, tmpl: &str, params: &[Param]) -> DbResult<u64> {
    let sql = template::build(tmpl, params)?;
    db.exec_raw(&sql).await
}

/// Run a templated query and decode all rows.
pub async fn query(db: &dyn Database, tmpl: &str, params: &[Param]) -> DbResult<Vec<SqlRow>> {
    let sql = template::build(tmpl, params)?;
    db.query_raw(&sql).await
}

/// A named server-side lock preventing two migrations from targeting the
/// same table at once.
///
/// Backed by `GET_LOCK` on a dedicated session. The lock is released
/// explicitly via [`MetadataLock::release`], or implicitly when the session
/// drops and its connection closes.
pub struct MetadataLock {
    session: Box<dyn DbSession>,
    name: String,
}

// MySQL caps user-level lock names at 64 characters.
const MAX_LOCK_NAME_LEN: usize = 64;

fn lock_name(schema: &str, table: &str) -> String {
    let mut name = format!("{schema}.{table}");
    if name.len() > MAX_LOCK_NAME_LEN {
        name.truncate(MAX_LOCK_NAME_LEN);
    }
    name
}

impl MetadataLock {
    /// Acquire the lock for `schema`.`table`, waiting up to `timeout`.
    pub async fn acquire(
        db: &dyn Database,
        schema: &str,
        table: &str,
        timeout: Duration,
    ) -> DbResult<Self> {
        let name = lock_name(schema, table);
        let mut session = db.session().await?;
        let sql = template::build(
            "SELECT GET_LOCK(%?, %?)",
            &[Param::Str(name.clone()), Param::UInt(timeout.as_secs())],
        )?;
        let rows = session.query_raw(&sql).await?;
        let acquired = rows
            .first()
            .and_then(|r| r.values.first())
            .and_then(SqlValue::as_i64)
            == Some(1);
        if !acquired {
            return Err(DbError::LockBusy(name));
        }
        Ok(Self { session, name })
    }

    /// The lock name as registered on the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock and return the session to the pool.
    pub async fn release(mut self) -> DbResult<()> {
        let sql = template::build("SELECT RELEASE_LOCK(%?)", &[Param::Str(self.name.clone())])?;
        self.session.query_raw(&sql).await?;
        Ok(())
    }
}
