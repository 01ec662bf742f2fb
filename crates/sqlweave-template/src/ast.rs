//! Typed template AST

/// `{{ ref('model') }}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefNode {
    pub model: String,
    pub line: usize,
}

/// `{{ source('namespace', 'table') }}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNode {
    pub namespace: String,
    pub table: String,
    pub line: usize,
}

/// `{{ config(key='value', ...) }}`, elided from rendered output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNode {
    pub entries: Vec<(String, String)>,
    pub line: usize,
}

/// `{{ this }}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThisNode {
    pub line: usize,
}

/// `{{ var('name', 'default') }}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarNode {
    pub name: String,
    pub default: Option<String>,
    pub line: usize,
}

/// `{% if is_incremental() %} ... {% else %} ... {% endif %}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalBlock {
    /// Line of the opening `if`
    pub line: usize,

    /// Rendered when the model runs incrementally
    pub then_branch: Vec<Node>,

    /// Rendered otherwise (empty without `else`)
    pub else_branch: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Ref(RefNode),
    Source(SourceNode),
    Config(ConfigNode),
    This(ThisNode),
    Var(VarNode),
    Conditional(ConditionalBlock),
}

/// A parsed model template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTemplate {
    /// File the template was read from, used in error locations
    pub file: String,

    pub nodes: Vec<Node>,
}

impl ParsedTemplate {
    /// Visit every node depth-first, descending into both branches of
    /// conditional blocks.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        walk_nodes(&self.nodes, visit);
    }

    /// All `config(...)` nodes in document order
    pub fn config_nodes(&self) -> Vec<&ConfigNode> {
        let mut found = Vec::new();
        self.walk(&mut |node| {
            if let Node::Config(config) = node {
                found.push(config);
            }
        });
        found
    }
}

fn walk_nodes<'a>(nodes: &'a [Node], visit: &mut impl FnMut(&'a Node)) {
    for node in nodes {
        visit(node);
        if let Node::Conditional(block) = node {
            walk_nodes(&block.then_branch, visit);
            walk_nodes(&block.else_branch, visit);
        }
    }
}
