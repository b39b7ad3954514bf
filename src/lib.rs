#![forbid(unsafe_code)]

//! # shapeshift
//!
//! An online schema change engine for MySQL. An arbitrary `ALTER TABLE` is
//! applied by building a shadow copy of the table with the new schema,
//! copying rows across in key-range chunks while binlog replication keeps
//! the copy current, verifying the result by checksum, and swapping the
//! tables in a sub-second locked rename.
//!
//! ```text
//!            ┌───────────────────────────────────────────────┐
//!            │                    Runner                     │
//!            │  copy ─▶ sentinel ─▶ checksum ─▶ cutover      │
//!            └──┬─────────┬──────────┬──────────┬────────────┘
//!               ▼         ▼          ▼          ▼
//!           ┌──────┐ ┌─────────┐ ┌───────┐ ┌──────────┐
//!           │Copier│ │ Binlog  │ │Checker│ │Checkpoint│
//!           │      │ │ replay  │ │       │ │  writer  │
//!           └──┬───┘ └────┬────┘ └───┬───┘ └────┬─────┘
//!              └──────────┴─────┬────┴──────────┘
//!                               ▼
//!                        source + `_<t>_new`
//! ```
//!
//! The migration is resumable: progress is checkpointed durably and a
//! restarted run re-attaches to the shadow table, the copy watermark, and
//! the binlog position. See [`migration::Runner`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shapeshift::{Migration, Runner, Statement};
//!
//! let migration = Migration {
//!     host: "db.example.com:3306".into(),
//!     username: "migrator".into(),
//!     password: "secret".into(),
//!     database: "app".into(),
//!     statements: vec![Statement::alter_table("app", "orders", "ADD COLUMN note TEXT")],
//!     ..Migration::default()
//! };
//! let runner = Arc::new(Runner::new(migration, factory)?);
//! runner.run().await?;
//! ```

pub mod check;
pub mod checksum;
pub mod copier;
pub mod db;
pub mod factory;
pub mod metrics;
pub mod migration;
pub mod repl;
pub mod statement;
pub mod table;
pub mod throttle;

pub use factory::ComponentFactory;
pub use migration::{Migration, MigrationError, Progress, Result, Runner, Stage};
pub use statement::Statement;
