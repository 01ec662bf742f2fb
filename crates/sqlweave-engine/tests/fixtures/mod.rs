//! Test fixtures for engine integration tests
//!
//! A small shop project: two staging views over raw tables, an intermediate
//! table joining them and an incremental fact table.

#![allow(dead_code)]

use sqlweave_core::{Config, EngineSettings};
use sqlweave_engine::Engine;
use sqlweave_project::{Catalog, SourceDefinition};
use sqlweave_core::Relation;
use sqlweave_store::{MemoryStore, RelationState, RelationalStore, StoreError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const STG_CUSTOMERS: &str = "select id, name from {{ source('raw', 'customers') }}";

pub const STG_ORDERS: &str =
    "select id, customer_id, amount, updated_at from {{ source('raw', 'orders') }}";

pub const INT_CUSTOMER_ORDERS: &str = "{{ config(materialized='table') }}
select c.id, sum(o.amount) as total
from {{ ref('stg_customers') }} c
join {{ ref('stg_orders') }} o on o.customer_id = c.id
group by c.id";

pub const FCT_ORDERS: &str = "{{ config(materialized='incremental', unique_key='id') }}
select * from {{ ref('stg_orders') }}
{% if is_incremental() %}
where updated_at > (select max(updated_at) from {{ this }})
{% endif %}";

/// The three-model scenario
pub fn scenario_models() -> Vec<(&'static str, &'static str)> {
    vec![
        ("stg_customers", STG_CUSTOMERS),
        ("stg_orders", STG_ORDERS),
        ("int_customer_orders", INT_CUSTOMER_ORDERS),
    ]
}

pub fn raw_sources() -> Vec<SourceDefinition> {
    vec![
        SourceDefinition::new("raw", "customers", "raw"),
        SourceDefinition::new("raw", "orders", "raw"),
    ]
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.target.schema = "analytics".to_string();
    config
}

pub fn catalog(models: Vec<(&'static str, &'static str)>) -> Arc<Catalog> {
    Arc::new(Catalog::from_parts(models, raw_sources(), &config()).unwrap())
}

/// A store holding the raw tables the project reads
pub fn raw_store() -> MemoryStore {
    MemoryStore::builder()
        .with_table("raw.customers", 250)
        .with_table("raw.orders", 1_000)
        .build()
}

pub fn engine(models: Vec<(&'static str, &'static str)>, store: &MemoryStore, settings: EngineSettings) -> Engine {
    Engine::new(catalog(models), Arc::new(store.clone()), settings)
}

/// Store wrapper tracking how many calls are in flight at once
pub struct ConcurrencyStore {
    inner: MemoryStore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Most calls ever in flight together
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn tracked<T>(&self, call: impl std::future::Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = call.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait::async_trait]
impl RelationalStore for ConcurrencyStore {
    fn name(&self) -> &'static str {
        "Concurrency"
    }

    async fn relation_state(&self, relation: &Relation) -> Result<RelationState, StoreError> {
        self.tracked(self.inner.relation_state(relation)).await
    }

    async fn execute(&self, statement: &str) -> Result<(), StoreError> {
        self.tracked(self.inner.execute(statement)).await
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), StoreError> {
        self.tracked(self.inner.execute_transaction(statements)).await
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        self.inner.test_connection().await
    }
}
