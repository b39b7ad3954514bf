//! Migration safety checks.
//!
//! Checks run at three points in the lifecycle; the set that runs is chosen
//! by scope. Check implementations live with the preflight tooling and are
//! consumed through [`CheckRunner`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::db::Database;
use crate::statement::Statement;
use crate::table::TableInfo;

/// When a check set runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckScope {
    /// Before any writes: configuration, privileges, table shape.
    Preflight,
    /// After the shadow and checkpoint tables exist.
    PostSetup,
    /// Immediately before the rename.
    Cutover,
}

impl std::fmt::Display for CheckScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preflight => write!(f, "preflight"),
            Self::PostSetup => write!(f, "post-setup"),
            Self::Cutover => write!(f, "cutover"),
        }
    }
}

/// Errors from a failed check.
#[derive(Debug, thiserror::Error)]
#[error("{scope} check failed: {reason}")]
pub struct CheckError {
    /// The scope the failing check ran under.
    pub scope: CheckScope,
    /// Why the check failed.
    pub reason: String,
}

/// Everything a check may need to inspect.
#[derive(Clone)]
pub struct CheckResources {
    /// Main connection pool.
    pub db: Arc<dyn Database>,
    /// Replica pool when a replica DSN is configured.
    pub replica: Option<Arc<dyn Database>>,
    /// The table under migration, once resolved.
    pub table: Option<Arc<TableInfo>>,
    /// The statement under migration.
    pub statement: Statement,
    /// Per-chunk time budget.
    pub target_chunk_time: Duration,
    /// Copy concurrency.
    pub threads: usize,
    /// Maximum tolerated replica lag.
    pub replica_max_lag: Duration,
    /// Whether stuck statements are killed.
    pub force_kill: bool,
    /// Connection endpoint, for checks that run before a pool exists.
    pub host: String,
    /// Connection username.
    pub username: String,
    /// Connection password.
    pub password: String,
    /// Whether the old table is kept after cutover.
    pub skip_drop_after_cutover: bool,
}

/// Runs the check set for a scope.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    /// Run every check registered for `scope`; the first failure aborts.
    async fn run_checks(&self, resources: &CheckResources, scope: CheckScope) -> Result<(), CheckError>;
}
