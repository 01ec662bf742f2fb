//! Project loading and execution planning
//!
//! This crate handles:
//! - Loading model templates and source declarations into a `Catalog`
//! - Deriving dependency edges from template references
//! - Building level-ordered execution plans, with cycle reporting
//! - Selecting a subset of models for partial runs

pub mod graph;
pub mod loader;
pub mod selection;

pub use graph::{DependencyEdge, ExecutionPlan, GraphError, NodeRef};
pub use loader::{Catalog, LoadError, ModelDefinition, SourceDefinition, MODELS_DIR, SOURCES_FILE};
pub use selection::Selection;
