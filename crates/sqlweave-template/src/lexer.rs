//! Template lexer
//!
//! Splits a raw model template into literal text and tags:
//! `{{ expression }}`, `{% statement %}` and `{# comment #}`.
//! Comments are dropped here. A `-` just inside a tag delimiter trims the
//! whitespace on that side of the tag.

use crate::error::RenderError;

/// Lexical token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Literal SQL text
    Text(String),

    /// Body of a `{{ ... }}` tag, trimmed
    Expression { body: String, line: usize },

    /// Body of a `{% ... %}` tag, trimmed
    Statement { body: String, line: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Expression,
    Statement,
    Comment,
}

impl TagKind {
    fn open(self) -> &'static str {
        match self {
            Self::Expression => "{{",
            Self::Statement => "{%",
            Self::Comment => "{#",
        }
    }

    fn close(self) -> &'static str {
        match self {
            Self::Expression => "}}",
            Self::Statement => "%}",
            Self::Comment => "#}",
        }
    }
}

/// Lexer over one template
pub struct Lexer<'a> {
    file: &'a str,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(file: &'a str, src: &'a str) -> Self {
        Self { file, src }
    }

    /// Tokenize the whole template.
    ///
    /// Fails on the first tag whose closing delimiter is missing.
    pub fn tokenize(&self) -> Result<Vec<Token>, RenderError> {
        let mut tokens = Vec::new();
        let mut rest = self.src;
        let mut line = 1;
        let mut trim_next = false;

        while let Some((pos, kind)) = find_open(rest) {
            let text = &rest[..pos];
            let tag_line = line + count_newlines(text);
            let after_open = &rest[pos + 2..];

            let Some(end) = after_open.find(kind.close()) else {
                return Err(RenderError::syntax(
                    self.file,
                    tag_line,
                    format!("unterminated '{}' tag", kind.open()),
                ));
            };

            let mut body = &after_open[..end];
            let trim_left = body.starts_with('-');
            if trim_left {
                body = &body[1..];
            }
            let trim_right = body.ends_with('-');
            if trim_right {
                body = &body[..body.len() - 1];
            }

            let text = if trim_left { text.trim_end() } else { text };
            push_text(&mut tokens, text, trim_next);

            let body = body.trim().to_string();
            match kind {
                TagKind::Expression => tokens.push(Token::Expression { body, line: tag_line }),
                TagKind::Statement => tokens.push(Token::Statement { body, line: tag_line }),
                TagKind::Comment => {}
            }

            let consumed = end + kind.close().len();
            line = tag_line + count_newlines(&after_open[..consumed]);
            rest = &after_open[consumed..];
            trim_next = trim_right;
        }

        push_text(&mut tokens, rest, trim_next);
        Ok(tokens)
    }
}

/// Find the earliest tag opener
fn find_open(s: &str) -> Option<(usize, TagKind)> {
    let bytes = s.as_bytes();
    let mut from = 0;

    while let Some(offset) = s[from..].find('{') {
        let pos = from + offset;
        match bytes.get(pos + 1) {
            Some(b'{') => return Some((pos, TagKind::Expression)),
            Some(b'%') => return Some((pos, TagKind::Statement)),
            Some(b'#') => return Some((pos, TagKind::Comment)),
            _ => from = pos + 1,
        }
    }

    None
}

fn push_text(tokens: &mut Vec<Token>, text: &str, trim_start: bool) {
    let text = if trim_start { text.trim_start() } else { text };
    if text.is_empty() {
        return;
    }

    // Comments can leave two text runs next to each other
    if let Some(Token::Text(previous)) = tokens.last_mut() {
        previous.push_str(text);
    } else {
        tokens.push(Token::Text(text.to_string()));
    }
}

fn count_newlines(s: &str) -> usize {
    s.bytes().filter(|b| *b == b'\n').count()
}
