//! Test fixtures for store integration tests
//!
//! Relations and statement sequences shaped like what the engine issues for
//! each materialization.

use sqlweave_store::MemoryStore;

/// Raw tables a typical shop project reads from
pub const RAW_TABLES: &[(&str, u64)] = &[
    ("raw.orders", 1_000),
    ("raw.customers", 250),
    ("raw.payments", 1_200),
];

/// A store holding the raw shop tables
pub fn shop_store() -> MemoryStore {
    RAW_TABLES
        .iter()
        .fold(MemoryStore::builder(), |builder, (name, rows)| builder.with_table(name, *rows))
        .build()
}

/// Statements for a view materialization
pub fn view_statements(relation: &str, sql: &str) -> Vec<String> {
    vec![format!("CREATE OR REPLACE VIEW {} AS {}", relation, sql)]
}

/// Statements for a full table build
pub fn table_statements(relation: &str, sql: &str) -> Vec<String> {
    vec![
        format!("DROP TABLE IF EXISTS {}", relation),
        format!("CREATE TABLE {} AS {}", relation, sql),
    ]
}

/// Statements for a delete+insert incremental merge through a temporary table
pub fn merge_statements(relation: &str, unique_key: &str, sql: &str) -> Vec<String> {
    vec![
        format!("CREATE TEMP TABLE sqlweave_src ON COMMIT DROP AS {}", sql),
        format!(
            "DELETE FROM {rel} WHERE {key} IN (SELECT {key} FROM sqlweave_src)",
            rel = relation,
            key = unique_key
        ),
        format!("INSERT INTO {} SELECT * FROM sqlweave_src", relation),
    ]
}
