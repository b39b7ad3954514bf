//! Shared test doubles for migration lifecycle tests.
//!
//! Import via `mod common;` in integration test files. [`TestDb`] is an
//! in-memory stand-in for a MySQL server: it keeps a table registry, answers
//! the `information_schema` queries the engine issues, and records every
//! statement so tests can assert on exact SQL. [`TestFactory`] wires fake
//! workstreams (chunker, copier, replication client, checker, throttler)
//! into the runner.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};

use shapeshift::check::{CheckError, CheckResources, CheckRunner, CheckScope};
use shapeshift::checksum::{Checker, CheckerConfig, CheckerError};
use shapeshift::copier::{Copier, CopierConfig, CopierError};
use shapeshift::db::{Database, DbConfig, DbError, DbResult, DbSession, SqlRow, SqlValue};
use shapeshift::factory::ComponentFactory;
use shapeshift::migration::Migration;
use shapeshift::repl::{BinlogPosition, ReplClient, ReplClientConfig, ReplError, WatermarkGate};
use shapeshift::statement::Statement;
use shapeshift::table::{Chunker, ChunkerError, ChunkerProgress, Datum, TableInfo};
use shapeshift::throttle::{ThrottleError, Throttler};

// ============================================================================
// SQL text helpers
// ============================================================================

/// All backtick-quoted identifiers in `sql`, in order.
#[allow(dead_code)]
pub fn quoted_idents(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = sql;
    while let Some(start) = rest.find('`') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('`') else { break };
        out.push(after[..end].to_string());
        rest = &after[end + 1..];
    }
    out
}

/// All single-quoted string literals in `sql`, in order.
#[allow(dead_code)]
pub fn quoted_strings(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = sql;
    while let Some(start) = rest.find('\'') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('\'') else { break };
        out.push(after[..end].to_string());
        rest = &after[end + 1..];
    }
    out
}

// Parse a (possibly backtick-quoted) `schema.table` token starting at the
// beginning of `text`.
fn parse_table_token(text: &str) -> String {
    let mut out = String::new();
    let mut chars = text.chars().peekable();
    loop {
        match chars.peek() {
            Some('`') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '`' {
                        break;
                    }
                    out.push(c);
                }
            }
            Some('.') => {
                out.push('.');
                chars.next();
            }
            Some(c) if c.is_alphanumeric() || *c == '_' => {
                out.push(*c);
                chars.next();
            }
            _ => break,
        }
    }
    out
}

// ============================================================================
// In-memory database
// ============================================================================

/// Metadata the fake server tracks per table.
#[derive(Debug, Clone, Default)]
pub struct TableMeta {
    pub rows: u64,
    pub min: i64,
    pub max: i64,
    pub partitioned: bool,
}

#[derive(Debug)]
struct FailRule {
    fragment: String,
    code: u16,
    // Fail from the Nth matching statement (1-based) onward.
    from_nth: usize,
    seen: usize,
}

#[derive(Default)]
struct DbState {
    tables: HashMap<String, TableMeta>,
    exec_log: Vec<String>,
    query_log: Vec<String>,
    checkpoint_inserts: Vec<String>,
    checkpoint_rows: Vec<SqlRow>,
    fail_rules: Vec<FailRule>,
    max_connection_calls: Vec<u32>,
    sentinel_polls_until_drop: Option<u32>,
    refuse_instant: bool,
    refuse_inplace: bool,
}

/// An in-memory MySQL stand-in. Cloning shares state.
#[derive(Clone, Default)]
pub struct TestDb {
    state: Arc<Mutex<DbState>>,
}

#[allow(dead_code)]
impl TestDb {
    pub fn new() -> Self {
        let db = Self::default();
        {
            // The copy path should run unless a test opts into native DDL.
            let mut state = db.state.lock();
            state.refuse_instant = true;
            state.refuse_inplace = true;
        }
        db
    }

    pub fn seed_table(&self, schema: &str, table: &str, meta: TableMeta) {
        self.state
            .lock()
            .tables
            .insert(format!("{schema}.{table}"), meta);
    }

    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.state
            .lock()
            .tables
            .contains_key(&format!("{schema}.{table}"))
    }

    pub fn allow_instant_ddl(&self) {
        self.state.lock().refuse_instant = false;
    }

    pub fn allow_inplace_ddl(&self) {
        self.state.lock().refuse_inplace = false;
    }

    /// Statements containing `fragment` fail with `code` from the
    /// `from_nth` matching call (1-based) onward.
    pub fn fail_statements(&self, fragment: &str, code: u16, from_nth: usize) {
        self.state.lock().fail_rules.push(FailRule {
            fragment: fragment.to_string(),
            code,
            from_nth,
            seen: 0,
        });
    }

    /// The sentinel existence poll reports the table gone after `polls`
    /// more checks.
    pub fn drop_sentinel_after_polls(&self, polls: u32) {
        self.state.lock().sentinel_polls_until_drop = Some(polls);
    }

    /// Seed the row returned for checkpoint reads on resume.
    pub fn seed_checkpoint_row(&self, row: SqlRow) {
        self.state.lock().checkpoint_rows.push(row);
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.state.lock().exec_log.clone()
    }

    pub fn checkpoint_inserts(&self) -> Vec<String> {
        self.state.lock().checkpoint_inserts.clone()
    }

    pub fn query_log(&self) -> Vec<String> {
        self.state.lock().query_log.clone()
    }

    pub fn max_connection_calls(&self) -> Vec<u32> {
        self.state.lock().max_connection_calls.clone()
    }

    fn check_fail_rules(state: &mut DbState, sql: &str) -> DbResult<()> {
        for rule in &mut state.fail_rules {
            if sql.contains(rule.fragment.as_str()) {
                rule.seen += 1;
                if rule.seen >= rule.from_nth {
                    return Err(DbError::Server {
                        code: rule.code,
                        message: format!("scripted failure for '{}'", rule.fragment),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_exec(state: &mut DbState, sql: &str) -> DbResult<u64> {
        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            let target = parse_table_token(rest);
            let meta = sql
                .find(" LIKE ")
                .map(|i| parse_table_token(&sql[i + " LIKE ".len()..]))
                .and_then(|src| state.tables.get(&src).cloned())
                .unwrap_or_default();
            state.tables.insert(target, meta);
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            let target = parse_table_token(rest);
            state.tables.remove(&target);
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("RENAME TABLE ") {
            for pair in rest.split(", ") {
                let Some((from, to)) = pair.split_once(" TO ") else {
                    continue;
                };
                let from = parse_table_token(from);
                let to = parse_table_token(to);
                let Some(meta) = state.tables.remove(&from) else {
                    return Err(DbError::Server {
                        code: 1146,
                        message: format!("table {from} does not exist"),
                    });
                };
                state.tables.insert(to, meta);
            }
            return Ok(0);
        }
        if sql.starts_with("ALTER TABLE ") {
            if sql.contains(", ALGORITHM=INSTANT") && state.refuse_instant {
                return Err(DbError::Server {
                    code: 1845,
                    message: "ALGORITHM=INSTANT is not supported for this operation".into(),
                });
            }
            if sql.contains(", ALGORITHM=INPLACE") && state.refuse_inplace {
                return Err(DbError::Server {
                    code: 1846,
                    message: "ALGORITHM=INPLACE is not supported. Reason: test".into(),
                });
            }
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
            let target = parse_table_token(rest);
            if !state.tables.contains_key(&target) {
                return Err(DbError::Server {
                    code: 1146,
                    message: format!("table {target} does not exist"),
                });
            }
            return Ok(0);
        }
        if sql.starts_with("INSERT INTO ") {
            if sql.contains("_chkpnt") {
                state.checkpoint_inserts.push(sql.to_string());
            }
            return Ok(1);
        }
        Ok(0)
    }

    fn answer_query(state: &mut DbState, sql: &str) -> DbResult<Vec<SqlRow>> {
        let row = |values: Vec<SqlValue>| SqlRow {
            columns: (0..values.len()).map(|i| format!("c{i}")).collect(),
            values,
        };
        if sql.contains("GET_LOCK") || sql.contains("RELEASE_LOCK") {
            return Ok(vec![row(vec![SqlValue::Int(1)])]);
        }
        if sql.contains("information_schema.tables") && sql.contains("COUNT(*)") {
            // The schema and table are the trailing two string literals.
            let names = quoted_strings(sql);
            let (schema, table) = (
                names[names.len() - 2].clone(),
                names[names.len() - 1].clone(),
            );
            if table == "_spirit_sentinel" {
                if let Some(n) = state.sentinel_polls_until_drop {
                    if n == 0 {
                        state.tables.remove(&format!("{schema}.{table}"));
                        state.sentinel_polls_until_drop = None;
                    } else {
                        state.sentinel_polls_until_drop = Some(n - 1);
                    }
                }
            }
            let exists = state.tables.contains_key(&format!("{schema}.{table}"));
            return Ok(vec![row(vec![SqlValue::Int(i64::from(exists))])]);
        }
        if sql.contains("information_schema.tables") {
            // Skip literals like IFNULL(create_options, ''): the schema and
            // table are the trailing two.
            let names = quoted_strings(sql);
            let key = format!("{}.{}", names[names.len() - 2], names[names.len() - 1]);
            return match state.tables.get(&key) {
                Some(meta) => Ok(vec![row(vec![
                    SqlValue::UInt(meta.rows),
                    SqlValue::Text(if meta.partitioned {
                        "partitioned".into()
                    } else {
                        String::new()
                    }),
                ])]),
                None => Ok(vec![]),
            };
        }
        if sql.contains("information_schema.key_column_usage") {
            return Ok(vec![SqlRow {
                columns: vec!["column_name".into()],
                values: vec![SqlValue::Text("id".into())],
            }]);
        }
        if sql.starts_with("SELECT MIN(") {
            let idents = quoted_idents(sql);
            // MIN(`id`), MAX(`id`) FROM `schema`.`table`
            let key = format!("{}.{}", idents[2], idents[3]);
            let meta = state.tables.get(&key).cloned().unwrap_or_default();
            return Ok(vec![row(vec![
                SqlValue::Int(meta.min),
                SqlValue::Int(meta.max),
            ])]);
        }
        if sql.contains("_chkpnt") && sql.contains("ORDER BY id DESC") {
            let target = parse_table_token(sql.strip_prefix("SELECT * FROM ").unwrap_or(sql));
            if !state.tables.contains_key(&target) {
                return Err(DbError::Server {
                    code: 1146,
                    message: format!("table {target} does not exist"),
                });
            }
            return Ok(state.checkpoint_rows.last().cloned().into_iter().collect());
        }
        Ok(vec![])
    }
}

impl TestDb {
    // Server-side execution shared by every pool connected to this db.
    fn exec_shared(&self, sql: &str) -> DbResult<u64> {
        let mut state = self.state.lock();
        state.exec_log.push(sql.to_string());
        Self::check_fail_rules(&mut state, sql)?;
        Self::apply_exec(&mut state, sql)
    }

    fn query_shared(&self, sql: &str) -> DbResult<Vec<SqlRow>> {
        let mut state = self.state.lock();
        state.query_log.push(sql.to_string());
        Self::check_fail_rules(&mut state, sql)?;
        Self::answer_query(&mut state, sql)
    }

    fn record_max_connections(&self, max: u32) {
        self.state.lock().max_connection_calls.push(max);
    }
}

// ============================================================================
// Checkout-gated pool
// ============================================================================

/// Permit accounting for one fake pool: every statement or session checkout
/// takes a slot for its duration, mirroring the production semaphore.
#[derive(Default)]
pub struct PoolStats {
    pub capacity: AtomicU32,
    pub in_use: AtomicU32,
    pub high_water: AtomicU32,
    /// Checkouts that exceeded the configured capacity.
    pub over_capacity: AtomicU32,
    /// Statements issued through this pool (the shared server log in
    /// [`TestDb`] interleaves all pools).
    pub log: Mutex<Vec<String>>,
    pub max_connection_calls: Mutex<Vec<u32>>,
}

impl PoolStats {
    fn acquire(&self) {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if now > self.capacity.load(Ordering::SeqCst) {
            self.over_capacity.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether any statement through this pool contained `fragment`.
    pub fn saw_statement(&self, fragment: &str) -> bool {
        self.log.lock().iter().any(|s| s.contains(fragment))
    }
}

/// What `connect` hands out: one gated pool over the shared server.
/// Cloning shares the pool's accounting.
#[derive(Clone)]
pub struct TestPool {
    db: TestDb,
    pub stats: Arc<PoolStats>,
}

impl TestPool {
    fn new(db: TestDb, capacity: u32) -> Self {
        let stats = PoolStats::default();
        stats.capacity.store(capacity, Ordering::SeqCst);
        Self {
            db,
            stats: Arc::new(stats),
        }
    }
}

#[async_trait]
impl Database for TestPool {
    async fn exec_raw(&self, sql: &str) -> DbResult<u64> {
        self.stats.acquire();
        self.stats.log.lock().push(sql.to_string());
        let result = self.db.exec_shared(sql);
        self.stats.release();
        result
    }

    async fn query_raw(&self, sql: &str) -> DbResult<Vec<SqlRow>> {
        self.stats.acquire();
        self.stats.log.lock().push(sql.to_string());
        let result = self.db.query_shared(sql);
        self.stats.release();
        result
    }

    async fn session(&self) -> DbResult<Box<dyn DbSession>> {
        // A session pins one slot until dropped, like a checked-out
        // connection.
        self.stats.acquire();
        Ok(Box::new(TestSession {
            db: self.db.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn set_max_connections(&self, max: u32) {
        self.stats.max_connection_calls.lock().push(max);
        self.db.record_max_connections(max);
        // Grow-only, like the production pool.
        if max > self.stats.capacity.load(Ordering::SeqCst) {
            self.stats.capacity.store(max, Ordering::SeqCst);
        }
    }

    fn in_use(&self) -> u32 {
        self.stats.in_use.load(Ordering::SeqCst)
    }

    async fn close(&self) {}
}

struct TestSession {
    db: TestDb,
    stats: Arc<PoolStats>,
}

#[async_trait]
impl DbSession for TestSession {
    async fn exec_raw(&mut self, sql: &str) -> DbResult<u64> {
        self.stats.log.lock().push(sql.to_string());
        self.db.exec_shared(sql)
    }

    async fn query_raw(&mut self, sql: &str) -> DbResult<Vec<SqlRow>> {
        self.stats.log.lock().push(sql.to_string());
        self.db.query_shared(sql)
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.stats.release();
    }
}

// ============================================================================
// Fake workstreams
// ============================================================================

/// Records what it was opened with; completion is driven by [`TestCopier`].
#[derive(Default)]
pub struct TestChunker {
    pub opened: AtomicBool,
    pub opened_at: Mutex<Option<(String, Option<Datum>, u64)>>,
    pub low_watermark: Mutex<Option<String>>,
    pub rows_copied: AtomicU64,
    pub chunks_copied: AtomicU64,
    pub total_rows: AtomicU64,
}

#[async_trait]
impl Chunker for TestChunker {
    async fn open(&self) -> Result<(), ChunkerError> {
        self.opened.store(true, Ordering::SeqCst);
        *self.low_watermark.lock() = Some(watermark_json(0));
        Ok(())
    }

    async fn open_at_watermark(
        &self,
        watermark: &str,
        high: Option<Datum>,
        rows_copied: u64,
    ) -> Result<(), ChunkerError> {
        self.opened.store(true, Ordering::SeqCst);
        *self.opened_at.lock() = Some((watermark.to_string(), high, rows_copied));
        *self.low_watermark.lock() = Some(watermark.to_string());
        self.rows_copied.store(rows_copied, Ordering::SeqCst);
        Ok(())
    }

    fn get_low_watermark(&self) -> Result<String, ChunkerError> {
        self.low_watermark
            .lock()
            .clone()
            .ok_or(ChunkerError::WatermarkUnavailable)
    }

    fn progress(&self) -> ChunkerProgress {
        ChunkerProgress {
            rows_copied: self.rows_copied.load(Ordering::SeqCst),
            chunks_copied: self.chunks_copied.load(Ordering::SeqCst),
            total_rows: self.total_rows.load(Ordering::SeqCst),
        }
    }
}

/// Serialized watermark payload in the shape a key-range chunker would use.
#[allow(dead_code)]
pub fn watermark_json(key: i64) -> String {
    serde_json::json!({ "key": [key] }).to_string()
}

/// Completes after `delay`, or never when `block` is set.
pub struct TestCopier {
    chunker: Option<Arc<TestChunker>>,
    delay: Duration,
    block: Option<Arc<Notify>>,
    throttler: Mutex<Option<Arc<dyn Throttler>>>,
    started: Mutex<Option<Instant>>,
    pub ran: AtomicBool,
}

#[async_trait]
impl Copier for TestCopier {
    async fn run(&self) -> Result<(), CopierError> {
        *self.started.lock() = Some(Instant::now());
        if let Some(block) = &self.block {
            block.notified().await;
        }
        tokio::time::sleep(self.delay).await;
        if let Some(chunker) = &self.chunker {
            let total = chunker.total_rows.load(Ordering::SeqCst);
            chunker.rows_copied.store(total, Ordering::SeqCst);
            chunker
                .chunks_copied
                .store(total / 1000 + 1, Ordering::SeqCst);
            *chunker.low_watermark.lock() = Some(watermark_json(total as i64));
        }
        self.ran.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn key_above_high_watermark(&self, _key: &Datum) -> bool {
        false
    }

    fn get_progress(&self) -> String {
        if self.ran.load(Ordering::SeqCst) {
            "100.0%".into()
        } else {
            "0.0%".into()
        }
    }

    fn get_eta(&self) -> String {
        "0s".into()
    }

    fn exec_time(&self) -> Duration {
        Duration::ZERO
    }

    fn start_time(&self) -> Option<Instant> {
        *self.started.lock()
    }

    fn set_throttler(&self, throttler: Arc<dyn Throttler>) {
        *self.throttler.lock() = Some(throttler);
    }

    fn is_throttled(&self) -> bool {
        self.throttler
            .lock()
            .as_ref()
            .map(|t| t.is_throttled())
            .unwrap_or(false)
    }
}

/// Records subscriptions, positions, and flushes; streams nothing.
#[derive(Default)]
pub struct TestReplClient {
    pub subscriptions: Mutex<Vec<(String, String)>>,
    pub flushed_pos: Mutex<Option<BinlogPosition>>,
    pub apply_position: Mutex<BinlogPosition>,
    pub deltas: AtomicUsize,
    pub flush_count: AtomicUsize,
    pub periodic_stopped: AtomicBool,
    pub watermark_optimization: Mutex<Vec<bool>>,
    pub ddl_tx: Mutex<Option<mpsc::Sender<String>>>,
    pub run_fails: AtomicBool,
    pub closed: AtomicBool,
}

#[async_trait]
impl ReplClient for TestReplClient {
    fn add_subscription(
        &self,
        source: Arc<TableInfo>,
        shadow: Arc<TableInfo>,
        _gate: WatermarkGate,
    ) -> Result<(), ReplError> {
        self.subscriptions.lock().push((
            format!("{}.{}", source.schema_name, source.table_name),
            format!("{}.{}", shadow.schema_name, shadow.table_name),
        ));
        Ok(())
    }

    async fn run(&self) -> Result<(), ReplError> {
        if self.run_fails.load(Ordering::SeqCst) {
            return Err(ReplError::StartFailed {
                pos: self.flushed_pos.lock().clone().unwrap_or_default(),
                reason: "binlog file has been purged".into(),
            });
        }
        Ok(())
    }

    fn set_flushed_pos(&self, pos: BinlogPosition) {
        *self.flushed_pos.lock() = Some(pos);
    }

    fn get_binlog_apply_position(&self) -> BinlogPosition {
        self.apply_position.lock().clone()
    }

    fn set_key_above_watermark_optimization(&self, enabled: bool) {
        self.watermark_optimization.lock().push(enabled);
    }

    async fn periodic_flush(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if self.periodic_stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(interval) => {
                    self.deltas.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    fn stop_periodic_flush(&self) {
        self.periodic_stopped.store(true, Ordering::SeqCst);
    }

    async fn flush(&self) -> Result<(), ReplError> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        self.deltas.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn get_delta_len(&self) -> usize {
        self.deltas.load(Ordering::SeqCst)
    }

    fn set_ddl_notification(&self, channel: Option<mpsc::Sender<String>>) {
        *self.ddl_tx.lock() = channel;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Reports a scripted number of differences per run.
pub struct TestChecker {
    pub differences: u64,
    pub ran: AtomicBool,
    started: Mutex<Option<Instant>>,
}

#[async_trait]
impl Checker for TestChecker {
    async fn run(&self) -> Result<(), CheckerError> {
        *self.started.lock() = Some(Instant::now());
        self.ran.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn differences_found(&self) -> u64 {
        self.differences
    }

    fn exec_time(&self) -> Duration {
        Duration::ZERO
    }

    fn start_time(&self) -> Option<Instant> {
        *self.started.lock()
    }

    fn get_progress(&self) -> String {
        "1/1 chunks".into()
    }
}

/// Throttle signal controlled by the test.
#[derive(Default)]
pub struct TestThrottler {
    pub throttled: AtomicBool,
    pub opened: AtomicBool,
    pub closed: AtomicBool,
}

#[async_trait]
impl Throttler for TestThrottler {
    async fn open(&self) -> Result<(), ThrottleError> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ThrottleError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }
}

/// Records the scopes it ran; optionally fails one scope.
#[derive(Default)]
pub struct TestCheckRunner {
    pub scopes: Mutex<Vec<CheckScope>>,
    pub fail_scope: Mutex<Option<CheckScope>>,
}

#[async_trait]
impl CheckRunner for TestCheckRunner {
    async fn run_checks(
        &self,
        _resources: &CheckResources,
        scope: CheckScope,
    ) -> Result<(), CheckError> {
        self.scopes.lock().push(scope);
        if *self.fail_scope.lock() == Some(scope) {
            return Err(CheckError {
                scope,
                reason: "scripted check failure".into(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Component factory
// ============================================================================

/// Wires the fakes above into a [`Runner`].
pub struct TestFactory {
    pub db: TestDb,
    /// One entry per `connect` call, in order.
    pub pools: Mutex<Vec<TestPool>>,
    pub chunkers: Mutex<Vec<Arc<TestChunker>>>,
    pub copiers: Mutex<Vec<Arc<TestCopier>>>,
    pub repl_clients: Mutex<Vec<Arc<TestReplClient>>>,
    pub checkers: Mutex<Vec<Arc<TestChecker>>>,
    pub throttler: Arc<TestThrottler>,
    pub checks: Arc<TestCheckRunner>,
    pub connected_dsns: Mutex<Vec<String>>,
    /// Differences reported by successive checkers; empty queue means zero.
    pub checker_differences: Mutex<VecDeque<u64>>,
    /// Copy duration simulated by each copier.
    pub copier_delay: Mutex<Duration>,
    /// When set, copiers block on this instead of completing.
    pub copier_block: Mutex<Option<Arc<Notify>>>,
    /// When set, replication clients fail to start streaming.
    pub repl_run_fails: AtomicBool,
    /// Source-table rows seeded into new chunkers.
    pub source_rows: AtomicU64,
}

#[allow(dead_code)]
impl TestFactory {
    pub fn new(db: TestDb) -> Self {
        Self {
            db,
            pools: Mutex::new(Vec::new()),
            chunkers: Mutex::new(Vec::new()),
            copiers: Mutex::new(Vec::new()),
            repl_clients: Mutex::new(Vec::new()),
            checkers: Mutex::new(Vec::new()),
            throttler: Arc::new(TestThrottler::default()),
            checks: Arc::new(TestCheckRunner::default()),
            connected_dsns: Mutex::new(Vec::new()),
            checker_differences: Mutex::new(VecDeque::new()),
            copier_delay: Mutex::new(Duration::from_secs(60)),
            copier_block: Mutex::new(None),
            repl_run_fails: AtomicBool::new(false),
            source_rows: AtomicU64::new(10_000),
        }
    }

    pub fn last_repl(&self) -> Option<Arc<TestReplClient>> {
        self.repl_clients.lock().last().cloned()
    }

    /// The pool backing the runner's shared connection (the first connect).
    pub fn main_pool(&self) -> Option<TestPool> {
        self.pools.lock().first().cloned()
    }

    /// The first pool that issued a statement containing `fragment`.
    pub fn pool_with_statement(&self, fragment: &str) -> Option<TestPool> {
        self.pools
            .lock()
            .iter()
            .find(|p| p.stats.saw_statement(fragment))
            .cloned()
    }

    pub fn last_chunker(&self) -> Option<Arc<TestChunker>> {
        self.chunkers.lock().last().cloned()
    }

    pub fn first_chunker(&self) -> Option<Arc<TestChunker>> {
        self.chunkers.lock().first().cloned()
    }
}

#[async_trait]
impl ComponentFactory for TestFactory {
    async fn connect(&self, dsn: &str, config: &DbConfig) -> DbResult<Arc<dyn Database>> {
        self.connected_dsns.lock().push(dsn.to_string());
        let pool = TestPool::new(self.db.clone(), config.max_open_connections);
        self.pools.lock().push(pool.clone());
        Ok(Arc::new(pool))
    }

    async fn new_chunker(
        &self,
        _source: Arc<TableInfo>,
        _shadow: Arc<TableInfo>,
        _target_chunk_time: Duration,
    ) -> Result<Arc<dyn Chunker>, ChunkerError> {
        let chunker = Arc::new(TestChunker::default());
        chunker
            .total_rows
            .store(self.source_rows.load(Ordering::SeqCst), Ordering::SeqCst);
        self.chunkers.lock().push(Arc::clone(&chunker));
        Ok(chunker)
    }

    fn new_multi_chunker(&self, chunkers: Vec<Arc<dyn Chunker>>) -> Arc<dyn Chunker> {
        // Lifecycle tests only exercise the first member.
        chunkers
            .into_iter()
            .next()
            .unwrap_or_else(|| Arc::new(TestChunker::default()))
    }

    async fn new_copier(
        &self,
        _db: Arc<dyn Database>,
        _chunker: Arc<dyn Chunker>,
        _config: CopierConfig,
    ) -> Result<Arc<dyn Copier>, CopierError> {
        let copier = Arc::new(TestCopier {
            chunker: self.last_chunker(),
            delay: *self.copier_delay.lock(),
            block: self.copier_block.lock().clone(),
            throttler: Mutex::new(None),
            started: Mutex::new(None),
            ran: AtomicBool::new(false),
        });
        self.copiers.lock().push(Arc::clone(&copier));
        Ok(copier)
    }

    fn new_repl_client(
        &self,
        _db: Arc<dyn Database>,
        config: ReplClientConfig,
    ) -> Arc<dyn ReplClient> {
        let repl = Arc::new(TestReplClient::default());
        repl.run_fails
            .store(self.repl_run_fails.load(Ordering::SeqCst), Ordering::SeqCst);
        *repl.ddl_tx.lock() = config.on_ddl;
        self.repl_clients.lock().push(Arc::clone(&repl));
        repl
    }

    async fn new_checker(
        &self,
        _db: Arc<dyn Database>,
        _chunker: Arc<dyn Chunker>,
        _repl: Arc<dyn ReplClient>,
        _config: CheckerConfig,
    ) -> Result<Arc<dyn Checker>, CheckerError> {
        let differences = self.checker_differences.lock().pop_front().unwrap_or(0);
        let checker = Arc::new(TestChecker {
            differences,
            ran: AtomicBool::new(false),
            started: Mutex::new(None),
        });
        self.checkers.lock().push(Arc::clone(&checker));
        Ok(checker)
    }

    async fn new_replica_throttler(
        &self,
        _replica: Arc<dyn Database>,
        _max_lag: Duration,
    ) -> Result<Arc<dyn Throttler>, ThrottleError> {
        Ok(Arc::clone(&self.throttler) as Arc<dyn Throttler>)
    }

    fn check_runner(&self) -> Arc<dyn CheckRunner> {
        Arc::clone(&self.checks) as Arc<dyn CheckRunner>
    }
}

// ============================================================================
// Migration helpers
// ============================================================================

/// A single-statement migration against the fake server's `test` schema.
#[allow(dead_code)]
pub fn test_migration(statement: Statement) -> Migration {
    Migration {
        host: "127.0.0.1:3306".into(),
        username: "root".into(),
        password: "secret".into(),
        database: "test".into(),
        threads: 2,
        statements: vec![statement],
        ..Migration::default()
    }
}

/// A fake server seeded with `test`.`t1` and its factory.
#[allow(dead_code)]
pub fn test_environment() -> (TestDb, Arc<TestFactory>) {
    let db = TestDb::new();
    db.seed_table(
        "test",
        "t1",
        TableMeta {
            rows: 10_000,
            min: 1,
            max: 10_000,
            partitioned: false,
        },
    );
    let factory = Arc::new(TestFactory::new(db.clone()));
    (db, factory)
}

/// A canned checkpoint row for resume tests.
#[allow(dead_code)]
pub fn checkpoint_row(
    copier_watermark: &str,
    checksum_watermark: &str,
    binlog_name: &str,
    binlog_pos: i64,
    rows_copied: u64,
    alter_statement: &str,
) -> SqlRow {
    SqlRow {
        columns: vec![
            "id".into(),
            "copier_watermark".into(),
            "checksum_watermark".into(),
            "binlog_name".into(),
            "binlog_pos".into(),
            "rows_copied".into(),
            "alter_statement".into(),
        ],
        values: vec![
            SqlValue::Int(1),
            SqlValue::Text(copier_watermark.into()),
            SqlValue::Text(checksum_watermark.into()),
            SqlValue::Text(binlog_name.into()),
            SqlValue::Int(binlog_pos),
            SqlValue::UInt(rows_copied),
            SqlValue::Text(alter_statement.into()),
        ],
    }
}
