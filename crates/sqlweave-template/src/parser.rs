//! Template parser: tokens to typed AST

use crate::ast::{ConditionalBlock, ConfigNode, Node, ParsedTemplate, RefNode, SourceNode, ThisNode, VarNode};
use crate::directive::Directive;
use crate::error::RenderError;
use crate::lexer::{Lexer, Token};

/// An `if` block still waiting for its `endif`
struct OpenBlock {
    line: usize,
    then_branch: Vec<Node>,
    else_branch: Option<Vec<Node>>,
}

impl OpenBlock {
    fn current(&mut self) -> &mut Vec<Node> {
        match &mut self.else_branch {
            Some(branch) => branch,
            None => &mut self.then_branch,
        }
    }
}

/// Statement tags understood by the parser
enum Statement {
    IfIncremental,
    Else,
    EndIf,
}

/// Parse a raw template into a typed AST without rendering anything.
pub fn parse(file: &str, raw: &str) -> Result<ParsedTemplate, RenderError> {
    let tokens = Lexer::new(file, raw).tokenize()?;

    let mut root: Vec<Node> = Vec::new();
    let mut open: Vec<OpenBlock> = Vec::new();

    for token in tokens {
        let node = match token {
            Token::Text(text) => Node::Text(text),
            Token::Expression { body, line } => expression_node(file, line, &body)?,
            Token::Statement { body, line } => {
                match parse_statement(file, line, &body)? {
                    Statement::IfIncremental => {
                        open.push(OpenBlock {
                            line,
                            then_branch: Vec::new(),
                            else_branch: None,
                        });
                    }
                    Statement::Else => {
                        let block = open.last_mut().ok_or_else(|| {
                            RenderError::syntax(file, line, "'else' without a matching 'if'")
                        })?;
                        if block.else_branch.is_some() {
                            return Err(RenderError::syntax(
                                file,
                                line,
                                format!("duplicate 'else' in block opened at line {}", block.line),
                            ));
                        }
                        block.else_branch = Some(Vec::new());
                    }
                    Statement::EndIf => {
                        let block = open.pop().ok_or_else(|| {
                            RenderError::syntax(file, line, "'endif' without a matching 'if'")
                        })?;
                        let node = Node::Conditional(ConditionalBlock {
                            line: block.line,
                            then_branch: block.then_branch,
                            else_branch: block.else_branch.unwrap_or_default(),
                        });
                        push_node(&mut root, &mut open, node);
                    }
                }
                continue;
            }
        };

        push_node(&mut root, &mut open, node);
    }

    if let Some(block) = open.last() {
        return Err(RenderError::syntax(
            file,
            block.line,
            "'if' block is never closed with 'endif'",
        ));
    }

    Ok(ParsedTemplate {
        file: file.to_string(),
        nodes: root,
    })
}

fn push_node(root: &mut Vec<Node>, open: &mut [OpenBlock], node: Node) {
    match open.last_mut() {
        Some(block) => block.current().push(node),
        None => root.push(node),
    }
}

fn expression_node(file: &str, line: usize, body: &str) -> Result<Node, RenderError> {
    let node = match Directive::parse(file, line, body)? {
        Directive::Ref { model } => Node::Ref(RefNode { model, line }),
        Directive::Source { namespace, table } => Node::Source(SourceNode { namespace, table, line }),
        Directive::Config { entries } => Node::Config(ConfigNode { entries, line }),
        Directive::This => Node::This(ThisNode { line }),
        Directive::Var { name, default } => Node::Var(VarNode { name, default, line }),
    };
    Ok(node)
}

fn parse_statement(file: &str, line: usize, body: &str) -> Result<Statement, RenderError> {
    let mut words = body.split_whitespace();
    let keyword = words.next().unwrap_or_default();
    let rest: String = words.collect();

    match keyword {
        "if" if rest == "is_incremental()" => Ok(Statement::IfIncremental),
        "if" => Err(RenderError::syntax(
            file,
            line,
            format!("unsupported condition '{}': only is_incremental() is allowed", rest),
        )),
        "else" if rest.is_empty() => Ok(Statement::Else),
        "endif" if rest.is_empty() => Ok(Statement::EndIf),
        "else" | "endif" => Err(RenderError::syntax(
            file,
            line,
            format!("'{}' takes no arguments", keyword),
        )),
        "" => Err(RenderError::syntax(file, line, "empty statement tag")),
        other => Err(RenderError::UnknownDirective {
            file: file.to_string(),
            line,
            name: other.to_string(),
        }),
    }
}
