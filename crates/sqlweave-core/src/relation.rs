//! Physical relations and materialization strategies

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifies a physical table or view in the target store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    /// Database/catalog name (omitted from the rendered name when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Schema name
    pub schema: String,

    /// Table or view name
    pub identifier: String,
}

impl Relation {
    /// Create a relation without a database qualifier
    pub fn new(schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database: None,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Set the database qualifier
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Get fully qualified name
    pub fn fqn(&self) -> String {
        match &self.database {
            Some(database) => format!("{}.{}.{}", database, self.schema, self.identifier),
            None => format!("{}.{}", self.schema, self.identifier),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// How a model's output is realized in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// `CREATE OR REPLACE VIEW`
    #[default]
    View,

    /// Full drop-and-create table
    Table,

    /// Table that is appended to (or merged into) once it exists
    Incremental,
}

impl Materialization {
    /// Parse the value of a `materialized=` config key
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "view" => Some(Self::View),
            "table" => Some(Self::Table),
            "incremental" => Some(Self::Incremental),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Table => "table",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modelling layer, derived from the model naming convention.
///
/// Informational only; it never affects scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// `stg_*`
    Staging,

    /// `int_*`
    Intermediate,

    /// `fct_*`, `dim_*`, `mart_*`
    Marts,

    /// Anything else
    Other,
}

impl Layer {
    /// Derive the layer from a model name
    pub fn from_model_name(name: &str) -> Self {
        if name.starts_with("stg_") {
            Self::Staging
        } else if name.starts_with("int_") {
            Self::Intermediate
        } else if ["fct_", "dim_", "mart_"].iter().any(|p| name.starts_with(p)) {
            Self::Marts
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staging => write!(f, "staging"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Marts => write!(f, "marts"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// SHA-256 hex digest of a raw template, recorded with each model run
pub fn template_checksum(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}
