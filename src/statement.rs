//! Parsed DDL statement descriptor.
//!
//! Statement classification and clause extraction happen upstream in the SQL
//! parser; this type carries the result into the migration lifecycle along
//! with the predicates the runner's policy decisions need.

use serde::{Deserialize, Serialize};

use crate::db::template::quote_ident;

/// One parsed DDL statement targeting a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Schema the statement targets.
    pub schema: String,
    /// Table the statement targets.
    pub table: String,
    /// The full original SQL text.
    pub statement: String,
    /// For an `ALTER TABLE`, the alter clause alone (everything after the
    /// table name). Empty otherwise.
    pub alter: String,
    /// Whether the statement is an `ALTER TABLE`.
    pub is_alter_table: bool,
    /// Whether the alter adds a `UNIQUE` index or constraint.
    pub adds_unique_index: bool,
    /// Whether the alter changes index visibility (`ALTER INDEX ... VISIBLE`
    /// / `INVISIBLE`).
    pub changes_index_visibility: bool,
}

impl Statement {
    /// Build an `ALTER TABLE` statement descriptor from its parts.
    pub fn alter_table(schema: impl Into<String>, table: impl Into<String>, alter: impl Into<String>) -> Self {
        let schema = schema.into();
        let table = table.into();
        let alter = alter.into();
        let statement = format!(
            "ALTER TABLE {}.{} {}",
            quote_ident(&schema),
            quote_ident(&table),
            alter
        );
        Self {
            schema,
            table,
            statement,
            alter,
            is_alter_table: true,
            adds_unique_index: false,
            changes_index_visibility: false,
        }
    }

    /// Build a descriptor for a non-ALTER statement (CREATE, DROP, RENAME),
    /// which the runner executes directly.
    pub fn other(schema: impl Into<String>, table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            statement: statement.into(),
            alter: String::new(),
            is_alter_table: false,
            adds_unique_index: false,
            changes_index_visibility: false,
        }
    }

    /// Mark the alter as adding a UNIQUE index.
    pub fn with_add_unique(mut self) -> Self {
        self.adds_unique_index = true;
        self
    }

    /// Mark the alter as changing index visibility.
    pub fn with_index_visibility(mut self) -> Self {
        self.changes_index_visibility = true;
        self
    }

    /// Whether the statement is an `ALTER TABLE`.
    pub fn is_alter_table(&self) -> bool {
        self.is_alter_table
    }

    /// Whether the alter adds a UNIQUE index or constraint.
    pub fn contains_add_unique(&self) -> bool {
        self.is_alter_table && self.adds_unique_index
    }

    /// Whether the alter changes index visibility.
    pub fn contains_index_visibility(&self) -> bool {
        self.is_alter_table && self.changes_index_visibility
    }
}
