//! Relational store trait used by the execution engine

use sqlweave_core::Relation;
use std::fmt;

/// Kind of an existing relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Table,
    View,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::Table => write!(f, "table"),
            RelationKind::View => write!(f, "view"),
        }
    }
}

/// Live state of a relation, probed right before a model renders.
///
/// Never cached across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelationState {
    /// `None` when the relation does not exist
    pub kind: Option<RelationKind>,

    /// Rows known to exist; always 0 for views and absent relations.
    /// Stores may report a lower bound (PostgreSQL reports at most 1).
    pub row_count: u64,
}

impl RelationState {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn table(row_count: u64) -> Self {
        Self {
            kind: Some(RelationKind::Table),
            row_count,
        }
    }

    pub fn view() -> Self {
        Self {
            kind: Some(RelationKind::View),
            row_count: 0,
        }
    }

    pub fn exists(&self) -> bool {
        self.kind.is_some()
    }

    /// A table holding at least one row
    pub fn is_populated_table(&self) -> bool {
        self.kind == Some(RelationKind::Table) && self.row_count > 0
    }
}

/// Errors returned by a store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Statement failed: {message}")]
    Statement { statement: String, message: String },

    #[error("Probe of {relation} failed: {message}")]
    Probe { relation: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn statement(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            statement: statement.into(),
            message: message.into(),
        }
    }
}

/// A relational engine that models materialize into.
///
/// Statements for one relation are issued sequentially by a single caller;
/// implementations must tolerate concurrent calls for distinct relations.
#[async_trait::async_trait]
pub trait RelationalStore: Send + Sync {
    /// Store name for logs (e.g., "PostgreSQL", "Memory")
    fn name(&self) -> &'static str;

    /// Whether `relation` exists, what kind it is and whether it holds rows
    async fn relation_state(&self, relation: &Relation) -> Result<RelationState, StoreError>;

    /// Execute one DDL/DML statement
    async fn execute(&self, statement: &str) -> Result<(), StoreError>;

    /// Execute statements atomically: either all apply or none do
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), StoreError>;

    /// Check the store is reachable before a run starts
    async fn test_connection(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_state_flags() {
        assert!(!RelationState::absent().exists());
        assert!(RelationState::view().exists());
        assert!(!RelationState::view().is_populated_table());
        assert!(!RelationState::table(0).is_populated_table());
        assert!(RelationState::table(3).is_populated_table());
    }
}
