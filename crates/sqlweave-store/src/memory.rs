//! In-memory relational store
//!
//! Understands exactly the statements the engine emits for materialization
//! and simulates their effect on a set of named relations. It is useful for:
//! - Engine tests without a database
//! - Dry runs that print the statements a run would issue
//! - Simulating failures and slow statements for specific relations
//!
//! Row counts are simulated: every `CREATE TABLE ... AS` and `INSERT INTO`
//! adds `rows_per_statement` rows (1 by default); `DELETE` leaves the count
//! unchanged since predicates are not evaluated. Temporary tables created
//! with `ON COMMIT DROP` disappear when their statement or transaction ends.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = MemoryStore::builder()
//!     .with_table("raw.orders", 100)
//!     .with_error_for("analytics.fct_orders", "permission denied")
//!     .with_latency_for("analytics.slow_model", 5_000)
//!     .build();
//!
//! store.execute("CREATE OR REPLACE VIEW analytics.stg_orders AS select 1").await?;
//! assert!(store.view_definition("analytics.stg_orders").await.is_some());
//! ```

use crate::store::{RelationKind, RelationState, RelationalStore, StoreError};
use regex::Regex;
use sqlweave_core::Relation;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;

/// A relation held by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRelation {
    pub kind: RelationKind,
    pub row_count: u64,

    /// SQL of the view, or the query the table was last created from
    pub definition: String,
}

/// Statement forms the store understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statement<'a> {
    CreateView { relation: &'a str, query: &'a str },
    CreateTable { relation: &'a str, query: &'a str },
    CreateTempTable { relation: &'a str, query: &'a str },
    DropTable { relation: &'a str },
    DropView { relation: &'a str },
    Insert { relation: &'a str },
    Delete { relation: &'a str },
}

impl<'a> Statement<'a> {
    fn relation(&self) -> &'a str {
        match self {
            Statement::CreateView { relation, .. }
            | Statement::CreateTable { relation, .. }
            | Statement::CreateTempTable { relation, .. }
            | Statement::DropTable { relation }
            | Statement::DropView { relation }
            | Statement::Insert { relation }
            | Statement::Delete { relation } => relation,
        }
    }
}

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("static statement pattern is valid"))
}

fn parse_statement(sql: &str) -> Option<Statement<'_>> {
    static CREATE_VIEW: OnceLock<Regex> = OnceLock::new();
    static CREATE_TABLE: OnceLock<Regex> = OnceLock::new();
    static CREATE_TEMP_TABLE: OnceLock<Regex> = OnceLock::new();
    static DROP: OnceLock<Regex> = OnceLock::new();
    static INSERT: OnceLock<Regex> = OnceLock::new();
    static DELETE: OnceLock<Regex> = OnceLock::new();

    let sql = sql.trim();

    if let Some(c) = pattern(&CREATE_VIEW, r"(?is)^CREATE\s+OR\s+REPLACE\s+VIEW\s+(\S+)\s+AS\s+(.*)$").captures(sql) {
        let (relation, query) = (c.get(1)?.as_str(), c.get(2)?.as_str());
        return Some(Statement::CreateView { relation, query });
    }
    if let Some(c) = pattern(&CREATE_TABLE, r"(?is)^CREATE\s+TABLE\s+(\S+)\s+AS\s+(.*)$").captures(sql) {
        let (relation, query) = (c.get(1)?.as_str(), c.get(2)?.as_str());
        return Some(Statement::CreateTable { relation, query });
    }
    if let Some(c) = pattern(
        &CREATE_TEMP_TABLE,
        r"(?is)^CREATE\s+TEMP(?:ORARY)?\s+TABLE\s+(\S+)\s+ON\s+COMMIT\s+DROP\s+AS\s+(.*)$",
    )
    .captures(sql)
    {
        let (relation, query) = (c.get(1)?.as_str(), c.get(2)?.as_str());
        return Some(Statement::CreateTempTable { relation, query });
    }
    if let Some(c) = pattern(&DROP, r"(?is)^DROP\s+(TABLE|VIEW)\s+IF\s+EXISTS\s+(\S+)$").captures(sql) {
        let relation = c.get(2)?.as_str();
        return Some(if c[1].eq_ignore_ascii_case("table") {
            Statement::DropTable { relation }
        } else {
            Statement::DropView { relation }
        });
    }
    if let Some(c) = pattern(&INSERT, r"(?is)^INSERT\s+INTO\s+(\S+)\s+.*$").captures(sql) {
        return Some(Statement::Insert { relation: c.get(1)?.as_str() });
    }
    if let Some(c) = pattern(&DELETE, r"(?is)^DELETE\s+FROM\s+(\S+)(\s+.*)?$").captures(sql) {
        return Some(Statement::Delete { relation: c.get(1)?.as_str() });
    }
    None
}

#[derive(Debug, Clone, Default)]
struct State {
    relations: HashMap<String, StoredRelation>,

    /// `ON COMMIT DROP` tables created since the last commit
    temporaries: Vec<String>,
}

impl State {
    fn apply(&mut self, sql: &str, rows_per_statement: u64) -> Result<(), StoreError> {
        let statement = parse_statement(sql)
            .ok_or_else(|| StoreError::statement(sql, "unsupported statement"))?;
        let name = statement.relation();
        let existing = self.relations.get(name).map(|r| r.kind);
        let fail = |message: String| Err(StoreError::statement(sql, message));

        match statement {
            Statement::CreateView { query, .. } => {
                if existing == Some(RelationKind::Table) {
                    return fail(format!("\"{}\" is not a view", name));
                }
                self.relations.insert(
                    name.to_string(),
                    StoredRelation {
                        kind: RelationKind::View,
                        row_count: 0,
                        definition: query.trim().to_string(),
                    },
                );
            }
            Statement::CreateTable { query, .. } | Statement::CreateTempTable { query, .. } => {
                if existing.is_some() {
                    return fail(format!("relation \"{}\" already exists", name));
                }
                self.relations.insert(
                    name.to_string(),
                    StoredRelation {
                        kind: RelationKind::Table,
                        row_count: rows_per_statement,
                        definition: query.trim().to_string(),
                    },
                );
                if matches!(statement, Statement::CreateTempTable { .. }) {
                    self.temporaries.push(name.to_string());
                }
            }
            Statement::DropTable { .. } => match existing {
                Some(RelationKind::Table) => {
                    self.relations.remove(name);
                }
                Some(RelationKind::View) => return fail(format!("\"{}\" is not a table", name)),
                None => {}
            },
            Statement::DropView { .. } => match existing {
                Some(RelationKind::View) => {
                    self.relations.remove(name);
                }
                Some(RelationKind::Table) => return fail(format!("\"{}\" is not a view", name)),
                None => {}
            },
            Statement::Insert { .. } => match self.relations.get_mut(name) {
                Some(relation) if relation.kind == RelationKind::Table => {
                    relation.row_count += rows_per_statement;
                }
                Some(_) => return fail(format!("cannot insert into view \"{}\"", name)),
                None => return fail(format!("relation \"{}\" does not exist", name)),
            },
            Statement::Delete { .. } => match existing {
                Some(RelationKind::Table) => {}
                Some(RelationKind::View) => return fail(format!("cannot delete from view \"{}\"", name)),
                None => return fail(format!("relation \"{}\" does not exist", name)),
            },
        }

        Ok(())
    }

    fn commit(&mut self) {
        for name in self.temporaries.drain(..) {
            self.relations.remove(&name);
        }
    }
}

/// In-memory store for tests and dry runs
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,

    /// Every statement received, in arrival order, including failed ones
    log: Arc<RwLock<Vec<String>>>,

    /// Errors returned for any statement or probe touching a relation
    errors: Arc<RwLock<HashMap<String, String>>>,

    /// Extra delay for statements touching a relation (milliseconds)
    slow: HashMap<String, u64>,

    fail_connection: bool,
    latency_ms: u64,
    rows_per_statement: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStoreBuilder::new().build()
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::new()
    }

    /// Add or replace a table with `row_count` rows
    pub async fn add_table(&self, relation: &str, row_count: u64) {
        self.state.write().await.relations.insert(
            relation.to_string(),
            StoredRelation {
                kind: RelationKind::Table,
                row_count,
                definition: String::new(),
            },
        );
    }

    /// Fail every statement and probe that touches `relation`
    pub async fn add_error_for(&self, relation: &str, message: impl Into<String>) {
        self.errors.write().await.insert(relation.to_string(), message.into());
    }

    pub async fn clear_errors(&self) {
        self.errors.write().await.clear();
    }

    pub async fn relation(&self, relation: &str) -> Option<StoredRelation> {
        self.state.read().await.relations.get(relation).cloned()
    }

    pub async fn view_definition(&self, relation: &str) -> Option<String> {
        self.relation(relation)
            .await
            .filter(|r| r.kind == RelationKind::View)
            .map(|r| r.definition)
    }

    pub async fn row_count(&self, relation: &str) -> Option<u64> {
        self.relation(relation).await.map(|r| r.row_count)
    }

    /// Names of all relations, sorted
    pub async fn relation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.relations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Statements received so far
    pub async fn statements(&self) -> Vec<String> {
        self.log.read().await.clone()
    }

    /// Statements that touched `relation`
    pub async fn statements_for(&self, relation: &str) -> Vec<String> {
        self.log
            .read()
            .await
            .iter()
            .filter(|sql| parse_statement(sql).map(|s| s.relation()) == Some(relation))
            .cloned()
            .collect()
    }

    pub async fn clear_statements(&self) {
        self.log.write().await.clear();
    }

    async fn simulate_latency(&self, relation: Option<&str>) {
        let extra = relation.and_then(|r| self.slow.get(r)).copied().unwrap_or(0);
        let total = self.latency_ms + extra;
        if total > 0 {
            tokio::time::sleep(Duration::from_millis(total)).await;
        }
    }

    async fn injected_error(&self, relation: &str) -> Option<String> {
        self.errors.read().await.get(relation).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RelationalStore for MemoryStore {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn relation_state(&self, relation: &Relation) -> Result<RelationState, StoreError> {
        let fqn = relation.fqn();
        self.simulate_latency(None).await;

        if let Some(message) = self.injected_error(&fqn).await {
            return Err(StoreError::Probe { relation: fqn, message });
        }

        let state = self.state.read().await;
        Ok(match state.relations.get(&fqn) {
            Some(stored) if stored.kind == RelationKind::Table => RelationState::table(stored.row_count),
            Some(_) => RelationState::view(),
            None => RelationState::absent(),
        })
    }

    async fn execute(&self, statement: &str) -> Result<(), StoreError> {
        self.log.write().await.push(statement.to_string());
        let relation = parse_statement(statement).map(|s| s.relation().to_string());
        self.simulate_latency(relation.as_deref()).await;

        if let Some(relation) = &relation {
            if let Some(message) = self.injected_error(relation).await {
                return Err(StoreError::statement(statement, message));
            }
        }

        let mut state = self.state.write().await;
        let applied = state.apply(statement, self.rows_per_statement);
        state.commit();
        applied
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), StoreError> {
        self.log.write().await.extend(statements.iter().cloned());

        for statement in statements {
            let relation = parse_statement(statement).map(|s| s.relation().to_string());
            self.simulate_latency(relation.as_deref()).await;
            if let Some(relation) = &relation {
                if let Some(message) = self.injected_error(relation).await {
                    return Err(StoreError::statement(statement.as_str(), message));
                }
            }
        }

        // Apply to a copy and swap it in only if every statement succeeds
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        for statement in statements {
            staged.apply(statement, self.rows_per_statement)?;
        }
        staged.commit();
        *state = staged;
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        self.simulate_latency(None).await;

        if self.fail_connection {
            Err(StoreError::Connection("Simulated connection failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Builder for a [`MemoryStore`] with pre-existing relations and failures
pub struct MemoryStoreBuilder {
    relations: HashMap<String, StoredRelation>,
    errors: HashMap<String, String>,
    slow: HashMap<String, u64>,
    fail_connection: bool,
    latency_ms: u64,
    rows_per_statement: u64,
}

impl MemoryStoreBuilder {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
            errors: HashMap::new(),
            slow: HashMap::new(),
            fail_connection: false,
            latency_ms: 0,
            rows_per_statement: 1,
        }
    }

    /// Add a table, e.g. a source, holding `row_count` rows
    pub fn with_table(mut self, relation: &str, row_count: u64) -> Self {
        self.relations.insert(
            relation.to_string(),
            StoredRelation {
                kind: RelationKind::Table,
                row_count,
                definition: String::new(),
            },
        );
        self
    }

    pub fn with_view(mut self, relation: &str, definition: &str) -> Self {
        self.relations.insert(
            relation.to_string(),
            StoredRelation {
                kind: RelationKind::View,
                row_count: 0,
                definition: definition.to_string(),
            },
        );
        self
    }

    /// Fail statements and probes touching `relation`
    pub fn with_error_for(mut self, relation: &str, message: &str) -> Self {
        self.errors.insert(relation.to_string(), message.to_string());
        self
    }

    /// Delay statements touching `relation`
    pub fn with_latency_for(mut self, relation: &str, latency_ms: u64) -> Self {
        self.slow.insert(relation.to_string(), latency_ms);
        self
    }

    /// Delay every call
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Rows added by each `CREATE TABLE ... AS` or `INSERT`
    pub fn with_rows_per_statement(mut self, rows: u64) -> Self {
        self.rows_per_statement = rows;
        self
    }

    pub fn build(self) -> MemoryStore {
        MemoryStore {
            state: Arc::new(RwLock::new(State {
                relations: self.relations,
                temporaries: Vec::new(),
            })),
            log: Arc::new(RwLock::new(Vec::new())),
            errors: Arc::new(RwLock::new(self.errors)),
            slow: self.slow,
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            rows_per_statement: self.rows_per_statement,
        }
    }
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_engine_statements() {
        assert_eq!(
            parse_statement("create or replace view s.v as select 1"),
            Some(Statement::CreateView { relation: "s.v", query: "select 1" })
        );
        assert_eq!(
            parse_statement("CREATE TABLE s.t AS\nselect *\nfrom x"),
            Some(Statement::CreateTable { relation: "s.t", query: "select *\nfrom x" })
        );
        assert_eq!(
            parse_statement("CREATE TEMP TABLE src ON COMMIT DROP AS select 1"),
            Some(Statement::CreateTempTable { relation: "src", query: "select 1" })
        );
        assert_eq!(parse_statement("DROP TABLE IF EXISTS s.t"), Some(Statement::DropTable { relation: "s.t" }));
        assert_eq!(parse_statement("DROP VIEW IF EXISTS s.v"), Some(Statement::DropView { relation: "s.v" }));
        assert_eq!(
            parse_statement("INSERT INTO s.t SELECT * FROM (select 1) AS src"),
            Some(Statement::Insert { relation: "s.t" })
        );
        assert_eq!(
            parse_statement("DELETE FROM s.t WHERE id IN (select id from x)"),
            Some(Statement::Delete { relation: "s.t" })
        );
        assert_eq!(parse_statement("VACUUM s.t"), None);
    }

    #[tokio::test]
    async fn view_lifecycle() {
        let store = MemoryStore::new();
        let relation = Relation::new("analytics", "stg_orders");

        assert_eq!(store.relation_state(&relation).await.unwrap(), RelationState::absent());

        store
            .execute("CREATE OR REPLACE VIEW analytics.stg_orders AS select 1")
            .await
            .unwrap();
        store
            .execute("CREATE OR REPLACE VIEW analytics.stg_orders AS select 2")
            .await
            .unwrap();

        assert_eq!(store.relation_state(&relation).await.unwrap(), RelationState::view());
        assert_eq!(
            store.view_definition("analytics.stg_orders").await.as_deref(),
            Some("select 2")
        );
        assert_eq!(store.statements().await.len(), 2);
    }

    #[tokio::test]
    async fn table_rebuild_and_insert() {
        let store = MemoryStore::builder().with_rows_per_statement(5).build();
        let relation = Relation::new("analytics", "fct_orders");

        store.execute("DROP TABLE IF EXISTS analytics.fct_orders").await.unwrap();
        store.execute("CREATE TABLE analytics.fct_orders AS select 1").await.unwrap();
        assert_eq!(store.relation_state(&relation).await.unwrap(), RelationState::table(5));

        store.execute("INSERT INTO analytics.fct_orders select 2").await.unwrap();
        assert_eq!(store.row_count("analytics.fct_orders").await, Some(10));

        let err = store.execute("CREATE TABLE analytics.fct_orders AS select 1").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let store = MemoryStore::builder().with_view("s.v", "select 1").with_table("s.t", 1).build();

        assert!(store.execute("DROP TABLE IF EXISTS s.v").await.is_err());
        assert!(store.execute("CREATE OR REPLACE VIEW s.t AS select 1").await.is_err());
        assert!(store.execute("INSERT INTO s.v select 1").await.is_err());
        assert!(store.execute("DELETE FROM s.missing WHERE true").await.is_err());
    }

    #[tokio::test]
    async fn transaction_is_atomic() {
        let store = MemoryStore::builder().with_table("s.t", 3).build();

        let statements = vec![
            "CREATE TEMP TABLE src ON COMMIT DROP AS select * from x".to_string(),
            "DELETE FROM s.t WHERE id IN (SELECT id FROM src)".to_string(),
            "INSERT INTO s.t SELECT * FROM src".to_string(),
            "INSERT INTO s.missing SELECT * FROM src".to_string(),
        ];
        assert!(store.execute_transaction(&statements).await.is_err());
        assert_eq!(store.row_count("s.t").await, Some(3));
        assert!(store.relation("src").await.is_none());

        store.execute_transaction(&statements[..3]).await.unwrap();
        assert_eq!(store.row_count("s.t").await, Some(4));
        assert_eq!(store.relation_names().await, vec!["s.t".to_string()]);
    }

    #[tokio::test]
    async fn temporary_table_outside_transaction_is_dropped() {
        let store = MemoryStore::new();
        store
            .execute("CREATE TEMP TABLE src ON COMMIT DROP AS select 1")
            .await
            .unwrap();
        assert!(store.relation("src").await.is_none());

        // Sequential merges in one session reuse the temporary name
        store
            .execute("CREATE TEMP TABLE src ON COMMIT DROP AS select 2")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_errors() {
        let store = MemoryStore::builder().with_error_for("s.bad", "permission denied").build();

        let err = store.execute("CREATE OR REPLACE VIEW s.bad AS select 1").await.unwrap_err();
        assert_eq!(
            err,
            StoreError::statement("CREATE OR REPLACE VIEW s.bad AS select 1", "permission denied")
        );
        assert!(store.relation_state(&Relation::new("s", "bad")).await.is_err());
        assert!(store.relation("s.bad").await.is_none());

        store.clear_errors().await;
        assert!(store.execute("CREATE OR REPLACE VIEW s.bad AS select 1").await.is_ok());
    }

    #[tokio::test]
    async fn unsupported_statement() {
        let store = MemoryStore::new();
        assert!(store.execute("VACUUM s.t").await.is_err());
    }

    #[tokio::test]
    async fn connection_failure() {
        assert!(MemoryStore::new().test_connection().await.is_ok());
        assert!(MemoryStore::builder()
            .with_connection_failure()
            .build()
            .test_connection()
            .await
            .is_err());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();

        clone.add_table("raw.orders", 10).await;
        assert_eq!(store.row_count("raw.orders").await, Some(10));
        assert_eq!(store.relation_names().await, vec!["raw.orders".to_string()]);
    }
}
