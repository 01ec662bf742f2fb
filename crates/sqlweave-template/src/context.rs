//! Render context
//!
//! Supplies everything a template may observe: how model and source names map
//! to physical relations, whether the model is rendering incrementally, its
//! own relation for `this`, and project variables.

use sqlweave_core::Relation;
use std::collections::{BTreeMap, HashMap};

/// Maps logical names to physical relations
pub trait RelationResolver: Send + Sync {
    /// Relation a model materializes into, if the model exists
    fn resolve_model(&self, name: &str) -> Option<Relation>;

    /// Relation a declared source points at, if declared
    fn resolve_source(&self, namespace: &str, table: &str) -> Option<Relation>;
}

/// Context for rendering one model
pub struct RenderContext<'a> {
    resolver: &'a dyn RelationResolver,
    this: Relation,
    is_incremental: bool,
    vars: Option<&'a BTreeMap<String, String>>,
}

impl<'a> RenderContext<'a> {
    /// Create a context for a model materializing into `this`.
    ///
    /// Starts non-incremental with no variables.
    pub fn new(resolver: &'a dyn RelationResolver, this: Relation) -> Self {
        Self {
            resolver,
            this,
            is_incremental: false,
            vars: None,
        }
    }

    /// Set whether `is_incremental()` blocks are included
    pub fn incremental(mut self, is_incremental: bool) -> Self {
        self.is_incremental = is_incremental;
        self
    }

    /// Attach project variables for `var()`
    pub fn with_vars(mut self, vars: &'a BTreeMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn resolver(&self) -> &dyn RelationResolver {
        self.resolver
    }

    pub fn this(&self) -> &Relation {
        &self.this
    }

    pub fn is_incremental(&self) -> bool {
        self.is_incremental
    }

    /// Look up a project variable
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.and_then(|vars| vars.get(name)).map(String::as_str)
    }
}

/// Resolver backed by in-memory maps.
///
/// Useful for rendering templates outside a loaded project.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    models: HashMap<String, Relation>,
    sources: HashMap<(String, String), Relation>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model relation
    pub fn with_model(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.models.insert(name.into(), relation);
        self
    }

    /// Register a source relation
    pub fn with_source(
        mut self,
        namespace: impl Into<String>,
        table: impl Into<String>,
        relation: Relation,
    ) -> Self {
        self.sources.insert((namespace.into(), table.into()), relation);
        self
    }
}

impl RelationResolver for MapResolver {
    fn resolve_model(&self, name: &str) -> Option<Relation> {
        self.models.get(name).cloned()
    }

    fn resolve_source(&self, namespace: &str, table: &str) -> Option<Relation> {
        self.sources
            .get(&(namespace.to_string(), table.to_string()))
            .cloned()
    }
}
