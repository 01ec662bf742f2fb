//! Template rendering for sqlweave models
//!
//! This crate handles:
//! - Lexing model templates into text and directive tags
//! - Parsing the closed directive set (`ref`, `source`, `config`, `this`,
//!   `var`, `is_incremental()` blocks) into a typed AST
//! - Rendering the AST to engine-native SQL against a `RenderContext`
//! - Static extraction of references and configuration without rendering

pub mod ast;
pub mod config;
pub mod context;
pub mod directive;
pub mod error;
pub mod extract;
pub mod lexer;
pub mod parser;
pub mod renderer;

pub use ast::{Node, ParsedTemplate, RefNode, SourceNode, ConfigNode, ThisNode, VarNode, ConditionalBlock};
pub use config::{ModelConfig, ConfigIssue};
pub use context::{RenderContext, RelationResolver, MapResolver};
pub use directive::Directive;
pub use error::RenderError;
pub use extract::{extract_references, extract_config, InvalidConfig, Reference};
pub use lexer::{Lexer, Token};
pub use parser::parse;
pub use renderer::{render, render_str, RenderedQuery};
