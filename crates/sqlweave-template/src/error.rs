//! Template errors

use sqlweave_core::{Diagnostic, ErrorCode, Location};

/// Error raised while parsing or rendering a template.
///
/// Every variant carries the file and the 1-indexed line of the offending tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("{file}:{line}: {message}")]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}:{line}: unknown directive '{name}'")]
    UnknownDirective {
        file: String,
        line: usize,
        name: String,
    },

    #[error("{file}:{line}: ref('{model}') does not name a model in the catalog")]
    UnknownReference {
        file: String,
        line: usize,
        model: String,
    },

    #[error("{file}:{line}: source('{namespace}', '{table}') is not declared")]
    UnknownSource {
        file: String,
        line: usize,
        namespace: String,
        table: String,
    },

    #[error("{file}:{line}: variable '{name}' is not defined and has no default")]
    UndefinedVariable {
        file: String,
        line: usize,
        name: String,
    },
}

impl RenderError {
    pub(crate) fn syntax(file: &str, line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    /// File the error was raised in
    pub fn file(&self) -> &str {
        match self {
            Self::Syntax { file, .. }
            | Self::UnknownDirective { file, .. }
            | Self::UnknownReference { file, .. }
            | Self::UnknownSource { file, .. }
            | Self::UndefinedVariable { file, .. } => file,
        }
    }

    /// 1-indexed line of the offending tag
    pub fn line(&self) -> usize {
        match self {
            Self::Syntax { line, .. }
            | Self::UnknownDirective { line, .. }
            | Self::UnknownReference { line, .. }
            | Self::UnknownSource { line, .. }
            | Self::UndefinedVariable { line, .. } => *line,
        }
    }

    /// Stable error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownReference { .. } => ErrorCode::UnknownReference,
            Self::UnknownSource { .. } => ErrorCode::UnknownSource,
            _ => ErrorCode::RenderError,
        }
    }

    /// Convert to a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.code(), self.to_string())
            .with_location(Location::with_line(self.file(), self.line()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_location() {
        let err = RenderError::UnknownDirective {
            file: "models/stg_orders.sql".to_string(),
            line: 3,
            name: "macro".to_string(),
        };

        assert_eq!(err.file(), "models/stg_orders.sql");
        assert_eq!(err.line(), 3);
        assert_eq!(err.to_string(), "models/stg_orders.sql:3: unknown directive 'macro'");

        let diag = err.to_diagnostic();
        assert_eq!(diag.code, ErrorCode::RenderError);
        assert_eq!(diag.location, Some(Location::with_line("models/stg_orders.sql", 3)));
    }
}
