//! Dependency graph construction and execution planning
//!
//! Edges are derived from template text on every build: each `ref()` makes
//! the referencing model depend on the referenced one, each `source()` adds a
//! leaf. Models are then grouped into levels with Kahn's algorithm so that
//! every dependency of a model lies in a strictly earlier level.

use sqlweave_core::{Diagnostic, ErrorCode, Location, SelectionPolicy};
use sqlweave_template::{extract_references, Reference};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::loader::Catalog;
use crate::selection::Selection;

/// Upstream end of a dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Model(String),
    Source { namespace: String, table: String },
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Model(name) => write!(f, "{}", name),
            NodeRef::Source { namespace, table } => write!(f, "source:{}.{}", namespace, table),
        }
    }
}

/// `from` must be built (or exist) before model `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub from: NodeRef,
    pub to: String,
}

/// Structural errors found while planning. No model runs when one occurs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{file}:{line}: model '{model}' references unknown model '{target}'")]
    UnknownReference {
        model: String,
        file: String,
        line: usize,
        target: String,
    },

    #[error("{file}:{line}: model '{model}' references undeclared source '{namespace}.{table}'")]
    UnknownSource {
        model: String,
        file: String,
        line: usize,
        namespace: String,
        table: String,
    },

    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<String> },

    #[error("selected model '{0}' does not exist")]
    UnknownSelection(String),
}

fn format_cycle(path: &[String]) -> String {
    let mut parts: Vec<&str> = path.iter().map(String::as_str).collect();
    if let Some(first) = path.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

impl GraphError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GraphError::UnknownReference { .. } | GraphError::UnknownSelection(_) => {
                ErrorCode::UnknownReference
            }
            GraphError::UnknownSource { .. } => ErrorCode::UnknownSource,
            GraphError::Cycle { .. } => ErrorCode::DependencyCycle,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::error(self.code(), self.to_string());
        match self {
            GraphError::UnknownReference { model, file, line, .. }
            | GraphError::UnknownSource { model, file, line, .. } => diagnostic
                .with_location(Location::with_line(file, *line))
                .with_model(model),
            GraphError::Cycle { .. } | GraphError::UnknownSelection(_) => diagnostic,
        }
    }
}

/// Ordered levels of models to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    levels: Vec<Vec<String>>,

    /// Edges into planned models
    edges: BTreeSet<DependencyEdge>,

    /// Planned model -> direct upstream models (in or out of the plan)
    upstream: BTreeMap<String, BTreeSet<String>>,

    /// Planned model -> upstream models excluded from the plan
    external: BTreeMap<String, BTreeSet<String>>,
}

impl ExecutionPlan {
    /// Plan every model in the catalog
    pub fn build(catalog: &Catalog) -> Result<Self, GraphError> {
        Self::build_for(catalog, &Selection::All, SelectionPolicy::WithUpstream)
    }

    /// Plan a selection of models.
    ///
    /// References and cycles are always checked over the whole catalog, so a
    /// selection never hides a structural error.
    pub fn build_for(
        catalog: &Catalog,
        selection: &Selection,
        policy: SelectionPolicy,
    ) -> Result<Self, GraphError> {
        let (deps, edges) = collect_dependencies(catalog)?;

        let all: BTreeSet<String> = deps.keys().cloned().collect();
        if let Err(remaining) = kahn_levels(&all, &deps) {
            let path = shortest_cycle(&remaining, &deps);
            tracing::debug!(cycle = ?path, "dependency cycle detected");
            return Err(GraphError::Cycle { path });
        }

        let planned = match selection {
            Selection::All => all,
            Selection::Models(names) => {
                let mut roots = BTreeSet::new();
                for name in names {
                    if !deps.contains_key(name) {
                        return Err(GraphError::UnknownSelection(name.clone()));
                    }
                    roots.insert(name.clone());
                }
                match policy {
                    SelectionPolicy::WithUpstream => upstream_closure(&roots, &deps),
                    SelectionPolicy::Exact => roots,
                }
            }
        };

        // Acyclic over the full catalog, so acyclic over any subset
        let levels = kahn_levels(&planned, &deps).unwrap_or_default();

        let mut upstream = BTreeMap::new();
        let mut external = BTreeMap::new();
        for name in &planned {
            let direct = deps.get(name).cloned().unwrap_or_default();
            let outside: BTreeSet<String> = direct.difference(&planned).cloned().collect();
            if !outside.is_empty() {
                external.insert(name.clone(), outside);
            }
            upstream.insert(name.clone(), direct);
        }

        let edges = edges
            .into_iter()
            .filter(|edge| planned.contains(&edge.to))
            .collect();

        let plan = Self {
            levels,
            edges,
            upstream,
            external,
        };
        tracing::info!(
            models = plan.len(),
            levels = plan.levels.len(),
            external = plan.external.len(),
            "execution plan built"
        );
        Ok(plan)
    }

    /// Levels in execution order, each sorted by name
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Planned models in execution order
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Index of the level a model runs in
    pub fn level_of(&self, model: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|name| name == model))
    }

    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter()
    }

    /// Direct upstream models of a planned model
    pub fn upstream(&self, model: &str) -> impl Iterator<Item = &str> {
        self.upstream
            .get(model)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Direct upstream models that are not part of this plan
    pub fn external_upstream(&self, model: &str) -> impl Iterator<Item = &str> {
        self.external
            .get(model)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// All models some planned model depends on but that are not planned
    pub fn external_models(&self) -> BTreeSet<&str> {
        self.external
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

type Dependencies = BTreeMap<String, BTreeSet<String>>;

/// Extract edges for every model, failing on the first unknown target in
/// (model name, line) order.
fn collect_dependencies(catalog: &Catalog) -> Result<(Dependencies, BTreeSet<DependencyEdge>), GraphError> {
    let mut deps: Dependencies = BTreeMap::new();
    let mut edges = BTreeSet::new();

    for model in catalog.models() {
        let file = model.file();
        let upstream = deps.entry(model.name.clone()).or_default();

        let references = match extract_references(&file, &model.raw_template) {
            Ok(references) => references,
            Err(err) => {
                tracing::debug!(model = %model.name, error = %err, "template does not parse, no edges");
                continue;
            }
        };

        for reference in references {
            match reference {
                Reference::Ref { model: target, line } => {
                    if catalog.model(&target).is_none() {
                        return Err(GraphError::UnknownReference {
                            model: model.name.clone(),
                            file,
                            line,
                            target,
                        });
                    }
                    upstream.insert(target.clone());
                    edges.insert(DependencyEdge {
                        from: NodeRef::Model(target),
                        to: model.name.clone(),
                    });
                }
                Reference::Source { namespace, table, line } => {
                    if catalog.source(&namespace, &table).is_none() {
                        return Err(GraphError::UnknownSource {
                            model: model.name.clone(),
                            file,
                            line,
                            namespace,
                            table,
                        });
                    }
                    edges.insert(DependencyEdge {
                        from: NodeRef::Source { namespace, table },
                        to: model.name.clone(),
                    });
                }
            }
        }
    }

    Ok((deps, edges))
}

/// Level partition of `nodes`, considering only edges inside `nodes`.
///
/// On a cycle, returns the nodes that could not be placed.
fn kahn_levels(nodes: &BTreeSet<String>, deps: &Dependencies) -> Result<Vec<Vec<String>>, BTreeSet<String>> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        let parents = deps
            .get(node)
            .into_iter()
            .flatten()
            .filter(|parent| nodes.contains(*parent));

        let mut degree = 0;
        for parent in parents {
            degree += 1;
            children.entry(parent.as_str()).or_default().push(node.as_str());
        }
        in_degree.insert(node.as_str(), degree);
    }

    let mut levels = Vec::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();

        for node in &ready {
            in_degree.remove(node);
            for child in children.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*child);
                    }
                }
            }
        }

        levels.push(ready.iter().map(|node| node.to_string()).collect());
        ready = next;
    }

    if in_degree.is_empty() {
        Ok(levels)
    } else {
        Err(in_degree.keys().map(|node| node.to_string()).collect())
    }
}

/// Transitive upstream of `roots`, roots included
fn upstream_closure(roots: &BTreeSet<String>, deps: &Dependencies) -> BTreeSet<String> {
    let mut seen = roots.clone();
    let mut queue: VecDeque<&String> = roots.iter().collect();

    while let Some(node) = queue.pop_front() {
        for parent in deps.get(node).into_iter().flatten() {
            if seen.insert(parent.clone()) {
                queue.push_back(parent);
            }
        }
    }

    seen
}

/// Shortest cycle among `remaining`, following "depends on" edges and
/// rotated to start at its smallest name. Ties go to the lexicographically
/// smallest path.
fn shortest_cycle(remaining: &BTreeSet<String>, deps: &Dependencies) -> Vec<String> {
    let mut best: Option<Vec<String>> = None;

    for start in remaining {
        let Some(mut cycle) = shortest_cycle_through(start, remaining, deps) else {
            continue;
        };

        if let Some(min_at) = cycle
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(index, _)| index)
        {
            cycle.rotate_left(min_at);
        }

        let better = match &best {
            None => true,
            Some(current) => (cycle.len(), &cycle) < (current.len(), current),
        };
        if better {
            best = Some(cycle);
        }
    }

    // Kahn only leaves nodes behind when a cycle exists
    best.unwrap_or_else(|| remaining.iter().cloned().collect())
}

/// Breadth-first search from `start` back to itself
fn shortest_cycle_through(start: &str, remaining: &BTreeSet<String>, deps: &Dependencies) -> Option<Vec<String>> {
    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut visited: HashSet<&str> = HashSet::from([start]);
    let mut queue: VecDeque<&str> = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let next_nodes = deps
            .get(node)
            .into_iter()
            .flatten()
            .filter(|next| remaining.contains(*next));

        for next in next_nodes {
            if next == start {
                let mut path = vec![node.to_string()];
                let mut current = node;
                while let Some(&previous) = parent.get(current) {
                    path.push(previous.to_string());
                    current = previous;
                }
                path.reverse();
                return Some(path);
            }
            if visited.insert(next.as_str()) {
                parent.insert(next.as_str(), node);
                queue.push_back(next.as_str());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SourceDefinition;
    use pretty_assertions::assert_eq;
    use sqlweave_core::Config;

    fn catalog(models: &[(&str, &str)]) -> Catalog {
        Catalog::from_parts(
            models.iter().copied(),
            vec![
                SourceDefinition::new("raw", "orders", "raw_data"),
                SourceDefinition::new("raw", "customers", "raw_data"),
            ],
            &Config::default(),
        )
        .unwrap()
    }

    fn scenario() -> Catalog {
        catalog(&[
            ("stg_orders", "select * from {{ source('raw', 'orders') }}"),
            ("stg_customers", "select * from {{ source('raw', 'customers') }}"),
            (
                "int_customer_orders",
                "select * from {{ ref('stg_orders') }} join {{ ref('stg_customers') }} using (customer_id)",
            ),
        ])
    }

    #[test]
    fn scenario_levels() {
        let plan = ExecutionPlan::build(&scenario()).unwrap();

        assert_eq!(
            plan.levels(),
            &[
                vec!["stg_customers".to_string(), "stg_orders".to_string()],
                vec!["int_customer_orders".to_string()],
            ]
        );
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.level_of("int_customer_orders"), Some(1));
        assert_eq!(
            plan.upstream("int_customer_orders").collect::<Vec<_>>(),
            vec!["stg_customers", "stg_orders"]
        );
        assert!(plan.edges().any(|edge| edge.from
            == NodeRef::Source {
                namespace: "raw".to_string(),
                table: "orders".to_string()
            }
            && edge.to == "stg_orders"));
    }

    #[test]
    fn dependencies_precede_dependents() {
        let catalog = catalog(&[
            ("a", "select 1"),
            ("b", "select * from {{ ref('a') }}"),
            ("c", "select * from {{ ref('b') }} join {{ ref('a') }}"),
            ("d", "select * from {{ ref('c') }}"),
            ("e", "select * from {{ ref('a') }}"),
        ]);
        let plan = ExecutionPlan::build(&catalog).unwrap();

        for model in plan.models() {
            let level = plan.level_of(model).unwrap();
            for upstream in plan.upstream(model) {
                assert!(plan.level_of(upstream).unwrap() < level, "{upstream} before {model}");
            }
        }
        assert_eq!(plan, ExecutionPlan::build(&catalog).unwrap());
    }

    #[test]
    fn references_inside_incremental_blocks_are_edges() {
        let catalog = catalog(&[
            ("a", "select 1"),
            ("b", "select 2 {% if is_incremental() %}union all select * from {{ ref('a') }}{% endif %}"),
        ]);
        let plan = ExecutionPlan::build(&catalog).unwrap();
        assert_eq!(plan.level_of("b"), Some(1));
    }

    #[test]
    fn unknown_reference_is_fatal() {
        let catalog = catalog(&[
            ("stg_orders", "select 1"),
            ("int_orders", "select *\nfrom {{ ref('stg_missing') }}"),
        ]);

        let err = ExecutionPlan::build(&catalog).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownReference {
                model: "int_orders".to_string(),
                file: "models/int_orders.sql".to_string(),
                line: 2,
                target: "stg_missing".to_string(),
            }
        );
        assert_eq!(err.code(), ErrorCode::UnknownReference);
    }

    #[test]
    fn unknown_source_is_fatal() {
        let catalog = catalog(&[("stg_refunds", "select * from {{ source('raw', 'refunds') }}")]);
        let err = ExecutionPlan::build(&catalog).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownSource);
    }

    #[test]
    fn first_offender_in_model_order() {
        let catalog = catalog(&[
            ("b", "select * from {{ ref('nope_b') }}"),
            ("a", "select 1\n{{ ref('nope_a2') }}\n{{ ref('nope_a3') }}"),
        ]);
        let err = ExecutionPlan::build(&catalog).unwrap_err();
        assert!(matches!(err, GraphError::UnknownReference { ref target, .. } if target == "nope_a2"));
    }

    #[test]
    fn reports_minimal_cycle() {
        let catalog = catalog(&[
            ("a", "select * from {{ ref('b') }}"),
            ("b", "select * from {{ ref('c') }}"),
            ("c", "select * from {{ ref('a') }}"),
            ("d", "select * from {{ ref('a') }}"),
            ("ok", "select 1"),
        ]);

        let err = ExecutionPlan::build(&catalog).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> c -> a");
    }

    #[test]
    fn shortest_of_overlapping_cycles() {
        let catalog = catalog(&[
            ("a", "select * from {{ ref('b') }}"),
            ("b", "select * from {{ ref('c') }} join {{ ref('d') }}"),
            ("c", "select * from {{ ref('a') }}"),
            ("d", "select * from {{ ref('b') }}"),
        ]);

        let err = ExecutionPlan::build(&catalog).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["b".to_string(), "d".to_string()]
            }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let catalog = catalog(&[("a", "select * from {{ ref('a') }}")]);
        let err = ExecutionPlan::build(&catalog).unwrap_err();
        assert_eq!(err, GraphError::Cycle { path: vec!["a".to_string()] });
    }

    #[test]
    fn selection_with_upstream() {
        let plan = ExecutionPlan::build_for(
            &scenario(),
            &Selection::models(["int_customer_orders"]),
            SelectionPolicy::WithUpstream,
        )
        .unwrap();

        assert_eq!(plan.len(), 3);
        assert!(plan.external_models().is_empty());
    }

    #[test]
    fn selection_exact() {
        let plan = ExecutionPlan::build_for(
            &scenario(),
            &Selection::models(["int_customer_orders"]),
            SelectionPolicy::Exact,
        )
        .unwrap();

        assert_eq!(plan.levels(), &[vec!["int_customer_orders".to_string()]]);
        assert_eq!(
            plan.external_upstream("int_customer_orders").collect::<Vec<_>>(),
            vec!["stg_customers", "stg_orders"]
        );
    }

    #[test]
    fn unknown_selection() {
        let err = ExecutionPlan::build_for(&scenario(), &Selection::models(["nope"]), SelectionPolicy::Exact)
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownSelection("nope".to_string()));
        assert_eq!(err.code(), ErrorCode::UnknownReference);
    }

    #[test]
    fn unparseable_template_has_no_edges() {
        let catalog = catalog(&[("a", "select 1"), ("b", "select * from {{ ref('a')")]);
        let plan = ExecutionPlan::build(&catalog).unwrap();
        assert_eq!(plan.levels(), &[vec!["a".to_string(), "b".to_string()]]);
    }
}
