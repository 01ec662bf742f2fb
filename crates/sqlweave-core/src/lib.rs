//! sqlweave core
//!
//! Shared domain model for the transformation engine: relations and
//! materializations, stable error codes, project configuration and the
//! run result schema consumed by the dashboard layer.
//! Never rename error codes - they are part of the public API.

pub mod diagnostic;
pub mod relation;
pub mod run;
pub mod config;

pub use diagnostic::{Diagnostic, ErrorCode, Location};
pub use relation::{Relation, Materialization, Layer, template_checksum};
pub use run::{RunSummary, RunCounts, ModelRunResult, ModelStatus, ModelRunRecord, SummaryVersion};
pub use config::{Config, ConfigError, TargetConfig, EngineSettings, RecorderSettings, SelectionPolicy};
