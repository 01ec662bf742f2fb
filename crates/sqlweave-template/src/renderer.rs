//! Template rendering
//!
//! Converts a parsed template to engine-native SQL. Rendering is a pure
//! function of the template and the context: no I/O, no shared state.

use crate::ast::{Node, ParsedTemplate};
use crate::context::RenderContext;
use crate::error::RenderError;
use crate::parser::parse;

/// Result of rendering a model template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedQuery {
    /// Rendered SQL, trimmed, without a trailing semicolon
    pub sql: String,

    /// Whether `is_incremental()` blocks were included
    pub is_incremental: bool,
}

/// Render a parsed template
pub fn render(template: &ParsedTemplate, ctx: &RenderContext<'_>) -> Result<RenderedQuery, RenderError> {
    let mut out = String::new();
    render_nodes(&template.file, &template.nodes, ctx, &mut out)?;

    let sql = out.trim().trim_end_matches(';').trim_end().to_string();

    Ok(RenderedQuery {
        sql,
        is_incremental: ctx.is_incremental(),
    })
}

/// Parse and render raw template text
pub fn render_str(file: &str, raw: &str, ctx: &RenderContext<'_>) -> Result<RenderedQuery, RenderError> {
    let template = parse(file, raw)?;
    render(&template, ctx)
}

fn render_nodes(
    file: &str,
    nodes: &[Node],
    ctx: &RenderContext<'_>,
    out: &mut String,
) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Ref(node) => {
                let relation = ctx.resolver().resolve_model(&node.model).ok_or_else(|| {
                    RenderError::UnknownReference {
                        file: file.to_string(),
                        line: node.line,
                        model: node.model.clone(),
                    }
                })?;
                out.push_str(&relation.fqn());
            }
            Node::Source(node) => {
                let relation = ctx
                    .resolver()
                    .resolve_source(&node.namespace, &node.table)
                    .ok_or_else(|| RenderError::UnknownSource {
                        file: file.to_string(),
                        line: node.line,
                        namespace: node.namespace.clone(),
                        table: node.table.clone(),
                    })?;
                out.push_str(&relation.fqn());
            }
            // Consumed at load time
            Node::Config(_) => {}
            Node::This(_) => out.push_str(&ctx.this().fqn()),
            Node::Var(node) => {
                let value = ctx
                    .var(&node.name)
                    .or(node.default.as_deref())
                    .ok_or_else(|| RenderError::UndefinedVariable {
                        file: file.to_string(),
                        line: node.line,
                        name: node.name.clone(),
                    })?;
                out.push_str(value);
            }
            Node::Conditional(block) => {
                let branch = if ctx.is_incremental() {
                    &block.then_branch
                } else {
                    &block.else_branch
                };
                render_nodes(file, branch, ctx, out)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MapResolver;
    use pretty_assertions::assert_eq;
    use sqlweave_core::Relation;
    use std::collections::BTreeMap;

    fn resolver() -> MapResolver {
        MapResolver::new()
            .with_model("stg_orders", Relation::new("analytics", "stg_orders"))
            .with_source("raw", "orders", Relation::new("raw_data", "orders").with_database("lake"))
    }

    const INCREMENTAL: &str = "{{ config(materialized='incremental', unique_key='order_id') }}
select * from {{ source('raw', 'orders') }}
{% if is_incremental() %}
where updated_at > (select max(updated_at) from {{ this }})
{% endif %}";

    #[test]
    fn renders_ref_and_source() {
        let resolver = resolver();
        let ctx = RenderContext::new(&resolver, Relation::new("analytics", "int_orders"));

        let rendered = render_str(
            "m.sql",
            "select * from {{ ref('stg_orders') }} o join {{ source('raw', 'orders') }} r using (id);",
            &ctx,
        )
        .unwrap();

        assert_eq!(
            rendered.sql,
            "select * from analytics.stg_orders o join lake.raw_data.orders r using (id)"
        );
        assert!(!rendered.is_incremental);
    }

    #[test]
    fn incremental_block_removed_when_not_incremental() {
        let resolver = resolver();
        let ctx = RenderContext::new(&resolver, Relation::new("analytics", "fct_orders"));

        let rendered = render_str("m.sql", INCREMENTAL, &ctx).unwrap();
        assert_eq!(rendered.sql, "select * from lake.raw_data.orders");
    }

    #[test]
    fn incremental_block_included_with_this() {
        let resolver = resolver();
        let ctx = RenderContext::new(&resolver, Relation::new("analytics", "fct_orders")).incremental(true);

        let rendered = render_str("m.sql", INCREMENTAL, &ctx).unwrap();
        assert_eq!(
            rendered.sql,
            "select * from lake.raw_data.orders\n\nwhere updated_at > (select max(updated_at) from analytics.fct_orders)"
        );
        assert!(rendered.is_incremental);
    }

    #[test]
    fn else_branch_used_for_full_builds() {
        let resolver = resolver();
        let raw = "select * from t where {% if is_incremental() %}a > 1{% else %}true{% endif %}";

        let full = RenderContext::new(&resolver, Relation::new("s", "t"));
        assert_eq!(render_str("m.sql", raw, &full).unwrap().sql, "select * from t where true");

        let incremental = RenderContext::new(&resolver, Relation::new("s", "t")).incremental(true);
        assert_eq!(render_str("m.sql", raw, &incremental).unwrap().sql, "select * from t where a > 1");
    }

    #[test]
    fn vars_and_defaults() {
        let resolver = resolver();
        let mut vars = BTreeMap::new();
        vars.insert("start_date".to_string(), "2024-01-01".to_string());
        let ctx = RenderContext::new(&resolver, Relation::new("s", "t")).with_vars(&vars);

        let rendered = render_str(
            "m.sql",
            "select '{{ var('start_date') }}', '{{ var('region', 'eu') }}'",
            &ctx,
        )
        .unwrap();
        assert_eq!(rendered.sql, "select '2024-01-01', 'eu'");

        let err = render_str("m.sql", "select {{ var('missing') }}", &ctx).unwrap_err();
        assert!(matches!(err, RenderError::UndefinedVariable { .. }));
    }

    #[test]
    fn unknown_reference_and_source() {
        let resolver = resolver();
        let ctx = RenderContext::new(&resolver, Relation::new("s", "t"));

        let err = render_str("models/x.sql", "select 1\nfrom {{ ref('stg_missing') }}", &ctx).unwrap_err();
        assert_eq!(
            err,
            RenderError::UnknownReference {
                file: "models/x.sql".to_string(),
                line: 2,
                model: "stg_missing".to_string(),
            }
        );

        let err = render_str("models/x.sql", "{{ source('raw', 'refunds') }}", &ctx).unwrap_err();
        assert!(matches!(err, RenderError::UnknownSource { .. }));
    }

    #[test]
    fn rendering_is_idempotent() {
        let resolver = resolver();
        let template = parse("m.sql", INCREMENTAL).unwrap();

        for incremental in [false, true] {
            let ctx = RenderContext::new(&resolver, Relation::new("analytics", "fct_orders"))
                .incremental(incremental);
            assert_eq!(render(&template, &ctx), render(&template, &ctx));
        }
    }
}
