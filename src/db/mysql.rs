//! `sqlx`-backed MySQL implementation of the [`Database`] trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Row};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::{Database, DbConfig, DbError, DbResult, DbSession, SqlRow, SqlValue};

// sqlx pools cannot grow after creation, so the pool is opened with headroom
// above the configured cap and admission is gated by a semaphore instead.
const POOL_HEADROOM: u32 = 4;

// Grace period beyond lock_wait_timeout before a statement is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// A MySQL connection pool with a resizable concurrency cap.
pub struct MySqlDatabase {
    pool: MySqlPool,
    permits: Arc<Semaphore>,
    max_connections: AtomicU32,
    config: DbConfig,
}

impl MySqlDatabase {
    /// Connect to `dsn` (a `mysql://` URL) and apply the session setup every
    /// new connection needs.
    pub async fn connect(dsn: &str, config: &DbConfig) -> DbResult<Self> {
        let session_init = format!(
            "SET SESSION innodb_lock_wait_timeout = {timeout}, lock_wait_timeout = {timeout}",
            timeout = config.lock_wait_timeout.as_secs()
        );
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_open_connections + POOL_HEADROOM)
            .after_connect(move |conn, _meta| {
                let stmt = session_init.clone();
                Box::pin(async move {
                    sqlx::query(&stmt).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(dsn)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Self {
            pool,
            permits: Arc::new(Semaphore::new(config.max_open_connections as usize)),
            max_connections: AtomicU32::new(config.max_open_connections),
            config: config.clone(),
        })
    }

    async fn acquire_permit(&self) -> DbResult<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| DbError::Connection(e.to_string()))
    }

    async fn checkout(&self) -> DbResult<PoolConnection<MySql>> {
        self.pool.acquire().await.map_err(map_sqlx_err)
    }

    /// Run `sql` on a checked-out connection, killing it server-side if it
    /// overstays the lock wait timeout and force-kill is enabled.
    async fn exec_on(&self, conn: &mut PoolConnection<MySql>, sql: &str) -> DbResult<u64> {
        if !self.config.force_kill {
            let result = sqlx::query(sql)
                .execute(&mut **conn)
                .await
                .map_err(map_sqlx_err)?;
            return Ok(result.rows_affected());
        }
        let connection_id = fetch_connection_id(&mut **conn).await?;
        let budget = self.config.lock_wait_timeout + KILL_GRACE;
        match tokio::time::timeout(budget, sqlx::query(sql).execute(&mut **conn)).await {
            Ok(result) => Ok(result.map_err(map_sqlx_err)?.rows_affected()),
            Err(_) => {
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    if let Err(e) = sqlx::query(&format!("KILL QUERY {connection_id}"))
                        .execute(&pool)
                        .await
                    {
                        warn!(connection_id, error = %e, "failed to kill stuck statement");
                    }
                });
                Err(DbError::Killed(budget))
            }
        }
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    async fn exec_raw(&self, sql: &str) -> DbResult<u64> {
        let _permit = self.acquire_permit().await?;
        let mut conn = self.checkout().await?;
        self.exec_on(&mut conn, sql).await
    }

    async fn query_raw(&self, sql: &str) -> DbResult<Vec<SqlRow>> {
        let _permit = self.acquire_permit().await?;
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn session(&self) -> DbResult<Box<dyn DbSession>> {
        let permit = self.acquire_permit().await?;
        let conn = self.checkout().await?;
        Ok(Box::new(MySqlSession {
            conn: Some(conn),
            _permit: permit,
        }))
    }

    fn set_max_connections(&self, max: u32) {
        let current = self.max_connections.load(Ordering::Acquire);
        if max <= current {
            warn!(current, requested = max, "pool cap can only grow; ignoring");
            return;
        }
        self.max_connections.store(max, Ordering::Release);
        self.permits.add_permits((max - current) as usize);
    }

    fn in_use(&self) -> u32 {
        self.pool.size().saturating_sub(self.pool.num_idle() as u32)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct MySqlSession {
    conn: Option<PoolConnection<MySql>>,
    _permit: OwnedSemaphorePermit,
}

impl MySqlSession {
    fn conn(&mut self) -> DbResult<&mut PoolConnection<MySql>> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::Connection("session is closed".into()))
    }
}

#[async_trait]
impl DbSession for MySqlSession {
    async fn exec_raw(&mut self, sql: &str) -> DbResult<u64> {
        let conn = self.conn()?;
        let result = sqlx::query(sql)
            .execute(&mut **conn)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn query_raw(&mut self, sql: &str) -> DbResult<Vec<SqlRow>> {
        let conn = self.conn()?;
        let rows = sqlx::query(sql)
            .fetch_all(&mut **conn)
            .await
            .map_err(map_sqlx_err)?;
        Ok(rows.iter().map(decode_row).collect())
    }
}

impl Drop for MySqlSession {
    fn drop(&mut self) {
        // Session-scoped server state (user locks, table locks, variables)
        // must not leak back into the pool; close the connection instead of
        // returning it.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

async fn fetch_connection_id(conn: &mut MySqlConnection) -> DbResult<u64> {
    let row = sqlx::query("SELECT CONNECTION_ID()")
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
    row.try_get::<u64, _>(0)
        .map_err(|e| DbError::Decode(e.to_string()))
}

fn map_sqlx_err(e: sqlx::Error) -> DbError {
    if let Some(db_err) = e.as_database_error() {
        if let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
            return DbError::Server {
                code: mysql_err.number() as u16,
                message: mysql_err.message().to_string(),
            };
        }
    }
    DbError::Connection(e.to_string())
}

fn decode_row(row: &MySqlRow) -> SqlRow {
    let columns = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = (0..row.columns().len()).map(|i| decode_value(row, i)).collect();
    SqlRow { columns, values }
}

fn decode_value(row: &MySqlRow, index: usize) -> SqlValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(SqlValue::Int).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map(SqlValue::UInt).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(SqlValue::Text).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map(SqlValue::Bytes).unwrap_or(SqlValue::Null);
    }
    SqlValue::Null
}
