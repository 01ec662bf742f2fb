//! Materialization statements
//!
//! Turns a rendered query into the DDL/DML that builds the model's relation,
//! given the relation's live state.

use sqlweave_core::{Materialization, Relation};
use sqlweave_store::{RelationKind, RelationState};

/// Temporary table holding the rendered query's rows during a merge.
///
/// The query may read the target through `{{ this }}`, so it is evaluated
/// exactly once, before the target is touched.
pub const MERGE_SOURCE: &str = "sqlweave_src";

/// Statements to run for one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statements {
    /// Run one after another; a failure stops the sequence
    Sequential(Vec<String>),

    /// Run atomically
    Transaction(Vec<String>),
}

impl Statements {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Statements::Sequential(statements) | Statements::Transaction(statements) => statements,
        }
    }
}

/// Whether `is_incremental()` blocks are included when rendering.
///
/// True only for incremental models whose target is a table that already
/// holds rows, and never on a full refresh.
pub fn renders_incrementally(materialization: Materialization, state: &RelationState, full_refresh: bool) -> bool {
    materialization == Materialization::Incremental && !full_refresh && state.is_populated_table()
}

/// Build the statements that materialize `sql` into `relation`
pub fn statements(
    materialization: Materialization,
    unique_key: Option<&str>,
    relation: &Relation,
    state: &RelationState,
    sql: &str,
    full_refresh: bool,
) -> Statements {
    let rel = relation.fqn();

    match materialization {
        Materialization::View => {
            let mut list = Vec::new();
            if state.kind == Some(RelationKind::Table) {
                list.push(format!("DROP TABLE IF EXISTS {}", rel));
            }
            list.push(format!("CREATE OR REPLACE VIEW {} AS {}", rel, sql));
            Statements::Sequential(list)
        }
        Materialization::Incremental if renders_incrementally(materialization, state, full_refresh) => {
            debug_assert!(unique_key.is_some(), "incremental models are loaded with a unique_key");
            let key = unique_key.unwrap_or_default();
            Statements::Transaction(vec![
                format!("CREATE TEMP TABLE {} ON COMMIT DROP AS {}", MERGE_SOURCE, sql),
                format!(
                    "DELETE FROM {rel} WHERE {key} IN (SELECT {key} FROM {src})",
                    rel = rel,
                    key = key,
                    src = MERGE_SOURCE
                ),
                format!("INSERT INTO {} SELECT * FROM {}", rel, MERGE_SOURCE),
            ])
        }
        Materialization::Table | Materialization::Incremental => {
            let drop = match state.kind {
                Some(RelationKind::View) => format!("DROP VIEW IF EXISTS {}", rel),
                _ => format!("DROP TABLE IF EXISTS {}", rel),
            };
            Statements::Sequential(vec![drop, format!("CREATE TABLE {} AS {}", rel, sql)])
        }
    }
}
