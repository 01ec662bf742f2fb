//! Model configuration carried by the `config(...)` directive

use sqlweave_core::Materialization;

use crate::ast::ConfigNode;

/// Resolved configuration for one model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelConfig {
    pub materialization: Materialization,

    /// Required iff `materialization` is incremental
    pub unique_key: Option<String>,
}

/// Why a `config(...)` directive was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigIssue {
    #[error("unknown config key '{0}' (expected one of: materialized, unique_key)")]
    UnknownKey(String),

    #[error("config key '{0}' is given more than once")]
    DuplicateKey(String),

    #[error("unknown materialization '{0}' (expected view, table or incremental)")]
    UnknownMaterialization(String),

    #[error("incremental models require a unique_key")]
    MissingUniqueKey,

    #[error("unique_key is only valid for incremental models, not {0}")]
    UnexpectedUniqueKey(Materialization),

    #[error("unique_key must not be empty")]
    EmptyUniqueKey,

    #[error("malformed config() directive: {0}")]
    Malformed(String),

    #[error("more than one config() directive (first at line {first}, again at line {second})")]
    MultipleDirectives { first: usize, second: usize },
}

impl ModelConfig {
    /// Validate a parsed `config(...)` node
    pub fn from_node(node: &ConfigNode) -> Result<Self, ConfigIssue> {
        let mut materialized: Option<&str> = None;
        let mut unique_key: Option<&str> = None;

        for (key, value) in &node.entries {
            let slot = match key.as_str() {
                "materialized" => &mut materialized,
                "unique_key" => &mut unique_key,
                _ => return Err(ConfigIssue::UnknownKey(key.clone())),
            };
            if slot.is_some() {
                return Err(ConfigIssue::DuplicateKey(key.clone()));
            }
            *slot = Some(value.as_str());
        }

        let materialization = match materialized {
            Some(value) => Materialization::parse(value)
                .ok_or_else(|| ConfigIssue::UnknownMaterialization(value.to_string()))?,
            None => Materialization::default(),
        };

        let unique_key = match unique_key.map(str::trim) {
            Some("") => return Err(ConfigIssue::EmptyUniqueKey),
            Some(key) => Some(key.to_string()),
            None => None,
        };

        match (materialization, &unique_key) {
            (Materialization::Incremental, None) => Err(ConfigIssue::MissingUniqueKey),
            (Materialization::View | Materialization::Table, Some(_)) => {
                Err(ConfigIssue::UnexpectedUniqueKey(materialization))
            }
            _ => Ok(Self {
                materialization,
                unique_key,
            }),
        }
    }
}
