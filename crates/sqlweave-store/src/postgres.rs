//! PostgreSQL relational store
//!
//! Executes materialization statements against PostgreSQL and probes relation
//! state from the system catalog. Works with PostgreSQL and compatible
//! engines that support `CREATE OR REPLACE VIEW` and `CREATE TABLE ... AS`.
//!
//! ## Probing
//!
//! Relations are looked up with `to_regclass`, so mixed-case model names fold
//! to lower case just like the statements that create them. Table probes only
//! check whether a row exists; the reported row count is 0 or 1.
//!
//! ## Connections
//!
//! The store opens a small pool of connections so that models in the same
//! level can run concurrently. Each statement, and each transaction as a
//! whole, runs on one connection held exclusively for its duration.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = PostgresStore::from_connection_string(
//!     "host=localhost port=5432 dbname=analytics user=postgres password=secret",
//!     4,
//! ).await?;
//!
//! // With TLS
//! let store = PostgresStore::from_connection_string_with_tls(
//!     "host=db.example.com port=5432 dbname=analytics user=postgres password=secret",
//!     4,
//! ).await?;
//! ```

use crate::store::{RelationalStore, RelationState, StoreError};
use sqlweave_core::Relation;

#[cfg(feature = "postgres")]
use crate::store::RelationKind;

#[cfg(feature = "postgres")]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "postgres")]
use tokio::sync::Mutex;

#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Config as PgConfig, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(not(feature = "postgres"))]
const NOT_COMPILED: &str = "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres";

/// PostgreSQL store
pub struct PostgresStore {
    #[cfg(feature = "postgres")]
    clients: Vec<Mutex<Client>>,

    #[cfg(feature = "postgres")]
    next: AtomicUsize,

    host: String,
    port: u16,
    database: String,

    #[cfg(not(feature = "postgres"))]
    _phantom: std::marker::PhantomData<()>,
}

impl PostgresStore {
    /// Connect without TLS, opening `pool_size` connections (at least one)
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string(conn_str: &str, pool_size: usize) -> Result<Self, StoreError> {
        Self::open(conn_str, pool_size, false).await
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string(_conn_str: &str, _pool_size: usize) -> Result<Self, StoreError> {
        Err(StoreError::Config(NOT_COMPILED.to_string()))
    }

    /// Connect with TLS; the `sslmode` setting is ignored and TLS is always used
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string_with_tls(conn_str: &str, pool_size: usize) -> Result<Self, StoreError> {
        Self::open(conn_str, pool_size, true).await
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string_with_tls(
        _conn_str: &str,
        _pool_size: usize,
    ) -> Result<Self, StoreError> {
        Err(StoreError::Config(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn open(conn_str: &str, pool_size: usize, tls: bool) -> Result<Self, StoreError> {
        let config: PgConfig = conn_str
            .parse()
            .map_err(|e| StoreError::Config(format!("Invalid connection string: {}", e)))?;

        // Extract connection info for logging
        let host = config
            .get_hosts()
            .first()
            .map(|h| format!("{:?}", h))
            .unwrap_or_else(|| "localhost".to_string());
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let database = config.get_dbname().unwrap_or("postgres").to_string();

        let mut clients = Vec::new();
        for _ in 0..pool_size.max(1) {
            let client = if tls {
                let connector = TlsConnector::builder()
                    .build()
                    .map_err(|e| StoreError::Config(format!("Failed to create TLS connector: {}", e)))?;
                let (client, connection) = config
                    .connect(MakeTlsConnector::new(connector))
                    .await
                    .map_err(|e| StoreError::Connection(format!("Failed to connect with TLS: {}", e)))?;
                spawn_connection(connection, host.clone(), port);
                client
            } else {
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .map_err(|e| StoreError::Connection(format!("Failed to connect: {}", e)))?;
                spawn_connection(connection, host.clone(), port);
                client
            };
            clients.push(Mutex::new(client));
        }

        tracing::info!(host = %host, port, database = %database, connections = clients.len(), "connected to PostgreSQL");

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            host,
            port,
            database,
        })
    }

    /// Take the next connection in round-robin order
    #[cfg(feature = "postgres")]
    async fn client(&self) -> tokio::sync::MutexGuard<'_, Client> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[index].lock().await
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

/// Drive a connection in the background until it closes
#[cfg(feature = "postgres")]
fn spawn_connection<S, T>(connection: tokio_postgres::Connection<S, T>, host: String, port: u16)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(host = %host, port, error = %e, "PostgreSQL connection error");
        }
    });
}

/// Map a `pg_class.relkind` code to a relation kind
#[cfg(feature = "postgres")]
fn relation_kind(relkind: i8) -> Option<RelationKind> {
    match relkind as u8 {
        b'r' | b'p' => Some(RelationKind::Table),
        b'v' | b'm' => Some(RelationKind::View),
        _ => None,
    }
}

#[cfg(feature = "postgres")]
const RELKIND_QUERY: &str = "SELECT c.relkind FROM pg_catalog.pg_class c WHERE c.oid = to_regclass($1::text)";

/// Stops at the first row instead of counting the table
#[cfg(feature = "postgres")]
fn has_rows_query(relation: &Relation) -> String {
    format!("SELECT EXISTS (SELECT 1 FROM {})", relation.fqn())
}

#[async_trait::async_trait]
impl RelationalStore for PostgresStore {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    #[cfg(feature = "postgres")]
    async fn relation_state(&self, relation: &Relation) -> Result<RelationState, StoreError> {
        let probe_error = |e: tokio_postgres::Error| StoreError::Probe {
            relation: relation.fqn(),
            message: e.to_string(),
        };

        // Resolve the name exactly as the unquoted DDL does, case folding included
        let fqn = relation.fqn();
        let client = self.client().await;
        let row = client
            .query_opt(
                RELKIND_QUERY,
                &[&fqn],
            )
            .await
            .map_err(probe_error)?;

        let Some(kind) = row.and_then(|row| relation_kind(row.get::<_, i8>(0))) else {
            return Ok(RelationState::absent());
        };

        match kind {
            RelationKind::View => Ok(RelationState::view()),
            RelationKind::Table => {
                let row = client
                    .query_one(has_rows_query(relation).as_str(), &[])
                    .await
                    .map_err(probe_error)?;
                let has_rows: bool = row.get(0);
                Ok(RelationState::table(u64::from(has_rows)))
            }
        }
    }

    #[cfg(not(feature = "postgres"))]
    async fn relation_state(&self, _relation: &Relation) -> Result<RelationState, StoreError> {
        Err(StoreError::Config(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn execute(&self, statement: &str) -> Result<(), StoreError> {
        let client = self.client().await;
        client
            .batch_execute(statement)
            .await
            .map_err(|e| StoreError::statement(statement, error_message(&e)))
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute(&self, _statement: &str) -> Result<(), StoreError> {
        Err(StoreError::Config(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), StoreError> {
        let mut client = self.client().await;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to begin transaction: {}", e)))?;

        for statement in statements {
            // Dropping the transaction without commit rolls it back
            transaction
                .batch_execute(statement)
                .await
                .map_err(|e| StoreError::statement(statement.as_str(), error_message(&e)))?;
        }

        transaction
            .commit()
            .await
            .map_err(|e| StoreError::statement("COMMIT", error_message(&e)))
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute_transaction(&self, _statements: &[String]) -> Result<(), StoreError> {
        Err(StoreError::Config(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn test_connection(&self) -> Result<(), StoreError> {
        let client = self.client().await;
        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| StoreError::Connection(format!("Connection test failed: {}", e)))?;
        Ok(())
    }

    #[cfg(not(feature = "postgres"))]
    async fn test_connection(&self) -> Result<(), StoreError> {
        Err(StoreError::Config(NOT_COMPILED.to_string()))
    }
}

/// Prefer the server's message over the client's generic "db error"
#[cfg(feature = "postgres")]
fn error_message(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db) => db.message().to_string(),
        None => error.to_string(),
    }
}
