//! Static extraction from templates without rendering
//!
//! The graph builder needs every `ref`/`source` a template mentions, in both
//! branches of `is_incremental()` blocks, and the loader needs the model's
//! `config(...)` before anything is rendered.

use regex::Regex;
use std::sync::OnceLock;

use crate::ast::{ConfigNode, Node};
use crate::config::{ConfigIssue, ModelConfig};
use crate::directive::Directive;
use crate::error::RenderError;
use crate::lexer::{Lexer, Token};
use crate::parser::parse;

/// A dependency mentioned by a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Ref { model: String, line: usize },
    Source { namespace: String, table: String, line: usize },
}

impl Reference {
    pub fn line(&self) -> usize {
        match self {
            Reference::Ref { line, .. } | Reference::Source { line, .. } => *line,
        }
    }
}

/// A rejected `config(...)` directive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{file}:{line}: {issue}")]
pub struct InvalidConfig {
    pub file: String,
    pub line: usize,
    pub issue: ConfigIssue,
}

/// Collect every reference in document order, duplicates included.
///
/// References inside both branches of conditional blocks are returned, so
/// the result does not depend on whether the model will run incrementally.
pub fn extract_references(file: &str, raw: &str) -> Result<Vec<Reference>, RenderError> {
    let template = parse(file, raw)?;

    let mut references = Vec::new();
    template.walk(&mut |node| match node {
        Node::Ref(node) => references.push(Reference::Ref {
            model: node.model.clone(),
            line: node.line,
        }),
        Node::Source(node) => references.push(Reference::Source {
            namespace: node.namespace.clone(),
            table: node.table.clone(),
            line: node.line,
        }),
        _ => {}
    });

    Ok(references)
}

fn config_call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*config\s*\(").expect("static config pattern is valid"))
}

/// Read the model's `config(...)` directive, if it has one.
///
/// Only `config` tags are interpreted, so a template whose other directives
/// are broken still yields its configuration; those errors surface when the
/// model is rendered. A template that cannot be tokenized at all yields
/// `Ok(None)` for the same reason.
pub fn extract_config(file: &str, raw: &str) -> Result<Option<ModelConfig>, InvalidConfig> {
    let tokens = match Lexer::new(file, raw).tokenize() {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::debug!(file, error = %err, "template does not tokenize, using default config");
            return Ok(None);
        }
    };

    let invalid = |line: usize, issue: ConfigIssue| InvalidConfig {
        file: file.to_string(),
        line,
        issue,
    };

    let mut found: Option<(usize, ModelConfig)> = None;

    for token in tokens {
        let Token::Expression { body, line } = token else {
            continue;
        };
        if !config_call_pattern().is_match(&body) {
            continue;
        }

        if let Some((first, _)) = &found {
            return Err(invalid(
                line,
                ConfigIssue::MultipleDirectives {
                    first: *first,
                    second: line,
                },
            ));
        }

        let entries = match Directive::parse(file, line, &body) {
            Ok(Directive::Config { entries }) => entries,
            Ok(other) => {
                return Err(invalid(line, ConfigIssue::Malformed(format!("unexpected '{}'", other.name()))))
            }
            Err(err) => return Err(invalid(line, ConfigIssue::Malformed(err.to_string()))),
        };

        let node = ConfigNode { entries, line };
        let config = ModelConfig::from_node(&node).map_err(|issue| invalid(line, issue))?;
        found = Some((line, config));
    }

    Ok(found.map(|(_, config)| config))
}
