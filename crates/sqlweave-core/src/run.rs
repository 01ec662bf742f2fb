//! Run result schema (stable v1)
//!
//! `RunSummary` is the structure handed back to the dashboard and monitoring
//! layers. This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::relation::Materialization;

/// Run summary schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl SummaryVersion {
    /// Current run summary schema version
    pub const CURRENT: SummaryVersion = SummaryVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for SummaryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Terminal status of a model within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one model in one run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRunResult {
    pub model_name: String,

    pub status: ModelStatus,

    pub materialization: Materialization,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration in seconds
    pub duration: f64,

    /// Human-readable error (failed and skipped models)
    pub error: Option<String>,

    /// Stable code for `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    /// Fully rendered query, when rendering got that far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_sql: Option<String>,

    /// Whether the model rendered with `is_incremental() == true`
    #[serde(default)]
    pub is_incremental: bool,
}

impl ModelRunResult {
    /// A model that rendered and executed successfully
    pub fn succeeded(
        model_name: impl Into<String>,
        materialization: Materialization,
        started_at: DateTime<Utc>,
        rendered_sql: String,
        is_incremental: bool,
    ) -> Self {
        Self::finish(
            model_name.into(),
            ModelStatus::Succeeded,
            materialization,
            started_at,
            None,
            Some(rendered_sql),
            is_incremental,
        )
    }

    /// A model that failed while probing, rendering or executing
    pub fn failed(
        model_name: impl Into<String>,
        materialization: Materialization,
        started_at: DateTime<Utc>,
        diagnostic: &Diagnostic,
        rendered_sql: Option<String>,
        is_incremental: bool,
    ) -> Self {
        Self::finish(
            model_name.into(),
            ModelStatus::Failed,
            materialization,
            started_at,
            Some(diagnostic),
            rendered_sql,
            is_incremental,
        )
    }

    /// A model that was never started
    pub fn skipped(
        model_name: impl Into<String>,
        materialization: Materialization,
        diagnostic: &Diagnostic,
    ) -> Self {
        Self::finish(
            model_name.into(),
            ModelStatus::Skipped,
            materialization,
            Utc::now(),
            Some(diagnostic),
            None,
            false,
        )
    }

    fn finish(
        model_name: String,
        status: ModelStatus,
        materialization: Materialization,
        started_at: DateTime<Utc>,
        diagnostic: Option<&Diagnostic>,
        rendered_sql: Option<String>,
        is_incremental: bool,
    ) -> Self {
        let finished_at = Utc::now();
        let duration = (finished_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            model_name,
            status,
            materialization,
            started_at,
            finished_at,
            duration,
            error: diagnostic.map(|d| d.message.clone()),
            error_code: diagnostic.map(|d| d.code),
            rendered_sql,
            is_incremental,
        }
    }
}

/// Aggregate counts for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total_models: usize,
    pub successes: usize,
    pub failures: usize,
    pub skipped: usize,
}

impl RunCounts {
    fn from_results(results: &[ModelRunResult]) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();

        Self {
            total_models: results.len(),
            successes: count(ModelStatus::Succeeded),
            failures: count(ModelStatus::Failed),
            skipped: count(ModelStatus::Skipped),
        }
    }
}

/// Run summary (run_summary.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Schema version
    pub version: SummaryVersion,

    pub run_id: Uuid,

    /// Run start (ISO 8601)
    pub timestamp: DateTime<Utc>,

    pub summary: RunCounts,

    /// One entry per model in the plan, in execution order
    pub results: Vec<ModelRunResult>,

    /// Wall-clock duration of the whole run in seconds
    pub total_duration: f64,

    /// The run was cancelled before every level was started
    #[serde(default)]
    pub cancelled: bool,
}

impl RunSummary {
    /// Build a summary from the collected model results
    pub fn from_results(
        run_id: Uuid,
        timestamp: DateTime<Utc>,
        results: Vec<ModelRunResult>,
        cancelled: bool,
    ) -> Self {
        let total_duration = (Utc::now() - timestamp)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            version: SummaryVersion::CURRENT,
            run_id,
            timestamp,
            summary: RunCounts::from_results(&results),
            results,
            total_duration,
            cancelled,
        }
    }

    /// Look up the result for a model
    pub fn result(&self, model_name: &str) -> Option<&ModelRunResult> {
        self.results.iter().find(|r| r.model_name == model_name)
    }

    /// Status of a model in this run
    pub fn status_of(&self, model_name: &str) -> Option<ModelStatus> {
        self.result(model_name).map(|r| r.status)
    }

    /// Check if any model failed
    pub fn has_failures(&self) -> bool {
        self.summary.failures > 0
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// Metadata record kept per model, updated after every run that touched it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRunRecord {
    pub model_name: String,
    pub run_id: Uuid,
    pub status: ModelStatus,
    pub materialization: Materialization,

    /// Fully qualified physical name
    pub relation: String,

    /// SHA-256 of the raw template that produced this run
    pub template_checksum: String,

    pub finished_at: DateTime<Utc>,

    /// Seconds
    pub duration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::ErrorCode;

    fn sample_results() -> Vec<ModelRunResult> {
        let failure = Diagnostic::error(ErrorCode::ExecutionError, "relation does not exist");
        let skip = Diagnostic::error(ErrorCode::UpstreamFailed, "upstream 'stg_orders' failed");

        vec![
            ModelRunResult::succeeded(
                "stg_customers",
                Materialization::View,
                Utc::now(),
                "select 1".to_string(),
                false,
            ),
            ModelRunResult::failed(
                "stg_orders",
                Materialization::View,
                Utc::now(),
                &failure,
                None,
                false,
            ),
            ModelRunResult::skipped("int_customer_orders", Materialization::Table, &skip),
        ]
    }

    #[test]
    fn summary_counts() {
        let summary = RunSummary::from_results(Uuid::new_v4(), Utc::now(), sample_results(), false);

        assert_eq!(summary.summary.total_models, 3);
        assert_eq!(summary.summary.successes, 1);
        assert_eq!(summary.summary.failures, 1);
        assert_eq!(summary.summary.skipped, 1);
        assert!(summary.has_failures());
        assert_eq!(summary.status_of("int_customer_orders"), Some(ModelStatus::Skipped));
        assert_eq!(
            summary.result("stg_orders").and_then(|r| r.error_code),
            Some(ErrorCode::ExecutionError)
        );
    }

    #[test]
    fn summary_json_shape() {
        let summary = RunSummary::from_results(Uuid::new_v4(), Utc::now(), sample_results(), false);
        let value: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();

        assert!(value.get("run_id").is_some());
        assert!(value.get("timestamp").is_some());
        assert_eq!(value["summary"]["total_models"], 3);
        assert_eq!(value["summary"]["successes"], 1);
        assert_eq!(value["summary"]["failures"], 1);

        let first = &value["results"][0];
        assert_eq!(first["model_name"], "stg_customers");
        assert_eq!(first["status"], "succeeded");
        assert!(first["duration"].is_number());
        assert!(first["error"].is_null());
        assert_eq!(value["results"][1]["error"], "relation does not exist");
    }

    #[test]
    fn summary_roundtrip() {
        let summary = RunSummary::from_results(Uuid::new_v4(), Utc::now(), sample_results(), true);
        let parsed: RunSummary = serde_json::from_str(&summary.to_json().unwrap()).unwrap();

        pretty_assertions::assert_eq!(parsed.run_id, summary.run_id);
        pretty_assertions::assert_eq!(parsed.timestamp, summary.timestamp);
        pretty_assertions::assert_eq!(parsed.summary, summary.summary);
        assert!(parsed.cancelled);

        let statuses = |s: &RunSummary| -> Vec<(String, ModelStatus, Option<ErrorCode>)> {
            s.results.iter().map(|r| (r.model_name.clone(), r.status, r.error_code)).collect()
        };
        pretty_assertions::assert_eq!(statuses(&parsed), statuses(&summary));
    }
}
