//! Error codes and structured diagnostics
//!
//! IMPORTANT: Error codes are versioned and stable.
//! NEVER rename or remove codes - the dashboard and monitoring layers key on them.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};

/// Error code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Load errors (1xxx)
    /// A definition or declaration file could not be read or parsed
    LoadError,

    /// Two model files share the same model name
    DuplicateModel,

    /// A config() directive is malformed or inconsistent
    InvalidConfig,

    /// A source() invocation names a namespace with no declaration
    UndeclaredSourceNamespace,

    // Graph errors (2xxx)
    /// ref() names a model that is not in the catalog
    UnknownReference,

    /// source() names a table that is not declared
    UnknownSource,

    /// The model graph contains a cycle
    DependencyCycle,

    // Per-model execution errors (3xxx)
    /// Template could not be rendered
    RenderError,

    /// The store rejected a DDL/DML statement
    ExecutionError,

    /// The model exceeded its execution timeout
    ModelTimeout,

    /// An upstream model outside the selection has no materialized relation
    MissingUpstream,

    /// The model was skipped because an upstream model did not succeed
    UpstreamFailed,

    /// The model was skipped because the run was cancelled
    RunCancelled,
}

impl ErrorCode {
    /// Get the error code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadError => "LOAD_ERROR",
            Self::DuplicateModel => "DUPLICATE_MODEL",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::UndeclaredSourceNamespace => "UNDECLARED_SOURCE_NAMESPACE",
            Self::UnknownReference => "UNKNOWN_REFERENCE",
            Self::UnknownSource => "UNKNOWN_SOURCE",
            Self::DependencyCycle => "DEPENDENCY_CYCLE",
            Self::RenderError => "RENDER_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ModelTimeout => "MODEL_TIMEOUT",
            Self::MissingUpstream => "MISSING_UPSTREAM",
            Self::UpstreamFailed => "UPSTREAM_FAILED",
            Self::RunCancelled => "RUN_CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source location in a project file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path relative to project root
    pub file: String,

    /// Optional line number (1-indexed)
    pub line: Option<usize>,
}

impl Location {
    /// Create a new location with just a file path
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
        }
    }

    /// Create a location with file and line number
    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => write!(f, "{}", self.file),
        }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Source location (best-effort)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Model the diagnostic is attributed to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Diagnostic {
    /// Create a diagnostic without location or model
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
            model: None,
        }
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Attribute the diagnostic to a model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {})", location)?;
        }
        Ok(())
    }
}
