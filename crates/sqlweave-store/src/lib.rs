//! Relational stores that models materialize into
//!
//! The execution engine talks to a store only through the
//! [`RelationalStore`] trait: probe a relation's state, execute a statement,
//! execute a group of statements atomically.
//!
//! ## Features
//!
//! - `postgres` - PostgreSQL support (plain and TLS connections)
//!
//! The in-memory store is always available.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlweave_store::{MemoryStore, RelationalStore};
//! use sqlweave_core::Relation;
//!
//! let store = MemoryStore::builder().with_table("raw.orders", 100).build();
//! let state = store.relation_state(&Relation::new("raw", "orders")).await?;
//! assert!(state.is_populated_table());
//! ```

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::{MemoryStore, MemoryStoreBuilder, StoredRelation};
pub use postgres::PostgresStore;
pub use store::{RelationKind, RelationState, RelationalStore, StoreError};
