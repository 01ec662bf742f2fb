//! Expression directives
//!
//! The body of every `{{ ... }}` tag must be one of the closed set below.
//!
//! Usage in templates:
//! - `{{ ref('model_name') }}`
//! - `{{ source('namespace', 'table_name') }}`
//! - `{{ config(materialized='incremental', unique_key='id') }}`
//! - `{{ this }}`
//! - `{{ var('name') }}` or `{{ var('name', 'default') }}`

use regex::Regex;
use std::sync::OnceLock;

use crate::error::RenderError;

/// A parsed expression tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Ref {
        model: String,
    },

    Source {
        namespace: String,
        table: String,
    },

    /// Keyword arguments in declaration order
    Config {
        entries: Vec<(String, String)>,
    },

    This,

    Var {
        name: String,
        default: Option<String>,
    },
}

/// One call argument
#[derive(Debug, Clone, PartialEq, Eq)]
enum Argument {
    Positional(String),
    Keyword(String, String),
}

fn call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$").expect("static call pattern is valid")
    })
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier pattern is valid")
    })
}

impl Directive {
    /// Parse the trimmed body of an expression tag
    pub fn parse(file: &str, line: usize, body: &str) -> Result<Self, RenderError> {
        let body = body.trim();

        if body == "this" {
            return Ok(Self::This);
        }

        let Some(captures) = call_pattern().captures(body) else {
            if identifier_pattern().is_match(body) {
                return Err(RenderError::UnknownDirective {
                    file: file.to_string(),
                    line,
                    name: body.to_string(),
                });
            }
            return Err(RenderError::syntax(file, line, format!("malformed expression '{}'", body)));
        };

        let name = &captures[1];
        let raw_args = &captures[2];

        match name {
            "ref" => {
                let [model] = positional::<1>(file, line, name, raw_args)?;
                Ok(Self::Ref { model })
            }
            "source" => {
                let [namespace, table] = positional::<2>(file, line, name, raw_args)?;
                Ok(Self::Source { namespace, table })
            }
            "var" => {
                let args = parse_arguments(file, line, raw_args)?;
                let values = only_positional(file, line, name, args)?;
                match values.len() {
                    1 | 2 => {
                        let mut values = values.into_iter();
                        let name = values.next().unwrap_or_default();
                        Ok(Self::Var { name, default: values.next() })
                    }
                    n => Err(RenderError::syntax(
                        file,
                        line,
                        format!("var() takes 1 or 2 arguments, got {}", n),
                    )),
                }
            }
            "config" => {
                let args = parse_arguments(file, line, raw_args)?;
                if args.is_empty() {
                    return Err(RenderError::syntax(file, line, "config() requires at least one keyword argument"));
                }
                let entries = args
                    .into_iter()
                    .map(|arg| match arg {
                        Argument::Keyword(key, value) => Ok((key, value)),
                        Argument::Positional(value) => Err(RenderError::syntax(
                            file,
                            line,
                            format!("config() only accepts keyword arguments, got '{}'", value),
                        )),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Config { entries })
            }
            _ => Err(RenderError::UnknownDirective {
                file: file.to_string(),
                line,
                name: name.to_string(),
            }),
        }
    }

    /// Directive name as written in templates
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ref { .. } => "ref",
            Self::Source { .. } => "source",
            Self::Config { .. } => "config",
            Self::This => "this",
            Self::Var { .. } => "var",
        }
    }
}

fn positional<const N: usize>(
    file: &str,
    line: usize,
    name: &str,
    raw_args: &str,
) -> Result<[String; N], RenderError> {
    let args = parse_arguments(file, line, raw_args)?;
    let values = only_positional(file, line, name, args)?;
    let count = values.len();

    values.try_into().map_err(|_| {
        RenderError::syntax(
            file,
            line,
            format!("{}() takes {} argument(s), got {}", name, N, count),
        )
    })
}

fn only_positional(
    file: &str,
    line: usize,
    name: &str,
    args: Vec<Argument>,
) -> Result<Vec<String>, RenderError> {
    args.into_iter()
        .map(|arg| match arg {
            Argument::Positional(value) => Ok(value),
            Argument::Keyword(key, _) => Err(RenderError::syntax(
                file,
                line,
                format!("{}() does not accept keyword argument '{}'", name, key),
            )),
        })
        .collect()
}

/// Split a call's argument list on commas outside string literals
fn parse_arguments(file: &str, line: usize, raw: &str) -> Result<Vec<Argument>, RenderError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in raw.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, ',') => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }

    if quote.is_some() {
        return Err(RenderError::syntax(file, line, "unterminated string literal"));
    }
    parts.push(current);

    parts
        .iter()
        .map(|part| parse_argument(file, line, part.trim()))
        .collect()
}

fn parse_argument(file: &str, line: usize, arg: &str) -> Result<Argument, RenderError> {
    if let Some(value) = string_literal(arg) {
        return Ok(Argument::Positional(value.to_string()));
    }

    if let Some((key, value)) = arg.split_once('=') {
        let key = key.trim();
        if identifier_pattern().is_match(key) {
            if let Some(value) = string_literal(value.trim()) {
                return Ok(Argument::Keyword(key.to_string(), value.to_string()));
            }
        }
    }

    Err(RenderError::syntax(
        file,
        line,
        format!("expected a quoted string argument, got '{}'", arg),
    ))
}

/// Extract string literal from quoted string
///
/// Handles both single and double quotes.
fn string_literal(s: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if let Some(content) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            if !content.contains(quote) {
                return Some(content);
            }
        }
    }
    None
}
