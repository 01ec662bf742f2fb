//! Run recording
//!
//! Persists run summaries, per-run logs and the latest metadata record for
//! each model. Recording is best-effort: the engine logs recorder errors and
//! carries on, so a broken recorder never changes a run's outcome.
//!
//! Recorders are synchronous. The engine calls them from blocking tasks, once
//! per level with the level's log lines and model records batched.
//!
//! ## Layout
//!
//! ```text
//! <output_dir>/
//!   model_runs.json            latest record per model
//!   runs/<run_id>/
//!     run_summary.json
//!     run.log
//! ```

use chrono::Utc;
use sqlweave_core::{ModelRunRecord, RunSummary};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub const MODEL_RUNS_FILE: &str = "model_runs.json";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const RUN_LOG_FILE: &str = "run.log";
pub const RUNS_DIR: &str = "runs";

/// Errors raised while recording
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Failed to write {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to serialize run data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to read {path}: {message}")]
    Corrupt { path: String, message: String },
}

impl RecorderError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Sink for run metadata
pub trait RunRecorder: Send + Sync {
    /// Store the latest record for one model, replacing any earlier one
    fn record_model(&self, record: &ModelRunRecord) -> Result<(), RecorderError>;

    /// Store the summary of a finished run
    fn record_summary(&self, summary: &RunSummary) -> Result<(), RecorderError>;

    /// Append a line to the run's log
    fn log(&self, run_id: &Uuid, line: &str) -> Result<(), RecorderError>;

    /// Store several model records at once
    fn record_models(&self, records: &[ModelRunRecord]) -> Result<(), RecorderError> {
        records.iter().try_for_each(|record| self.record_model(record))
    }

    /// Append several lines to the run's log, in order
    fn log_all(&self, run_id: &Uuid, lines: &[String]) -> Result<(), RecorderError> {
        lines.iter().try_for_each(|line| self.log(run_id, line))
    }
}

fn recover_mutex<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("recorder mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Recorder writing JSON and log files under an output directory
pub struct FileRecorder {
    output_dir: PathBuf,

    /// Serializes read-modify-write of `model_runs.json`
    records: Mutex<()>,
}

impl FileRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            records: Mutex::new(()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run_dir(&self, run_id: &Uuid) -> PathBuf {
        self.output_dir.join(RUNS_DIR).join(run_id.to_string())
    }

    pub fn model_runs_path(&self) -> PathBuf {
        self.output_dir.join(MODEL_RUNS_FILE)
    }

    /// Latest record per model; empty when nothing has been recorded yet
    pub fn load_model_runs(&self) -> Result<BTreeMap<String, ModelRunRecord>, RecorderError> {
        let path = self.model_runs_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| RecorderError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| RecorderError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load a previously recorded run summary
    pub fn load_summary(&self, run_id: &Uuid) -> Result<RunSummary, RecorderError> {
        let path = self.run_dir(run_id).join(RUN_SUMMARY_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| RecorderError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| RecorderError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn ensure_dir(path: &Path) -> Result<(), RecorderError> {
        std::fs::create_dir_all(path).map_err(|e| RecorderError::io(path, e))
    }
}

impl RunRecorder for FileRecorder {
    fn record_model(&self, record: &ModelRunRecord) -> Result<(), RecorderError> {
        self.record_models(std::slice::from_ref(record))
    }

    fn record_models(&self, new_records: &[ModelRunRecord]) -> Result<(), RecorderError> {
        if new_records.is_empty() {
            return Ok(());
        }
        let _guard = recover_mutex(&self.records);

        Self::ensure_dir(&self.output_dir)?;
        let mut records = self.load_model_runs()?;
        for record in new_records {
            records.insert(record.model_name.clone(), record.clone());
        }

        let path = self.model_runs_path();
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&path, json).map_err(|e| RecorderError::io(&path, e))
    }

    fn record_summary(&self, summary: &RunSummary) -> Result<(), RecorderError> {
        let dir = self.run_dir(&summary.run_id);
        Self::ensure_dir(&dir)?;

        let path = dir.join(RUN_SUMMARY_FILE);
        summary.save_to_file(&path).map_err(|e| RecorderError::io(&path, e))?;

        tracing::debug!(path = %path.display(), "run summary written");
        Ok(())
    }

    fn log(&self, run_id: &Uuid, line: &str) -> Result<(), RecorderError> {
        self.log_all(run_id, &[line.to_string()])
    }

    fn log_all(&self, run_id: &Uuid, lines: &[String]) -> Result<(), RecorderError> {
        if lines.is_empty() {
            return Ok(());
        }
        let dir = self.run_dir(run_id);
        Self::ensure_dir(&dir)?;

        let path = dir.join(RUN_LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RecorderError::io(&path, e))?;

        let timestamp = Utc::now().to_rfc3339();
        let text: String = lines.iter().map(|line| format!("{} {}\n", timestamp, line)).collect();
        file.write_all(text.as_bytes()).map_err(|e| RecorderError::io(&path, e))
    }
}

/// Recorder keeping everything in memory, for tests and embedding
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<BTreeMap<String, ModelRunRecord>>,
    summaries: Mutex<Vec<RunSummary>>,
    lines: Mutex<Vec<(Uuid, String)>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_record(&self, model_name: &str) -> Option<ModelRunRecord> {
        recover_mutex(&self.records).get(model_name).cloned()
    }

    pub fn model_records(&self) -> BTreeMap<String, ModelRunRecord> {
        recover_mutex(&self.records).clone()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        recover_mutex(&self.summaries).clone()
    }

    /// Log lines for one run, in order
    pub fn log_lines(&self, run_id: &Uuid) -> Vec<String> {
        recover_mutex(&self.lines)
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

impl RunRecorder for MemoryRecorder {
    fn record_model(&self, record: &ModelRunRecord) -> Result<(), RecorderError> {
        recover_mutex(&self.records).insert(record.model_name.clone(), record.clone());
        Ok(())
    }

    fn record_summary(&self, summary: &RunSummary) -> Result<(), RecorderError> {
        recover_mutex(&self.summaries).push(summary.clone());
        Ok(())
    }

    fn log(&self, run_id: &Uuid, line: &str) -> Result<(), RecorderError> {
        recover_mutex(&self.lines).push((*run_id, line.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlweave_core::{Materialization, ModelRunResult, ModelStatus};
    use tempfile::TempDir;

    fn record(model: &str, run_id: Uuid, status: ModelStatus) -> ModelRunRecord {
        ModelRunRecord {
            model_name: model.to_string(),
            run_id,
            status,
            materialization: Materialization::Table,
            relation: format!("analytics.{}", model),
            template_checksum: "abc".to_string(),
            finished_at: Utc::now(),
            duration: 0.5,
        }
    }

    #[test]
    fn file_recorder_keeps_latest_record_per_model() {
        let dir = TempDir::new().unwrap();
        let recorder = FileRecorder::new(dir.path());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        recorder.record_model(&record("orders", first, ModelStatus::Succeeded)).unwrap();
        recorder.record_model(&record("customers", first, ModelStatus::Succeeded)).unwrap();
        recorder.record_model(&record("orders", second, ModelStatus::Failed)).unwrap();

        let records = recorder.load_model_runs().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["orders"].run_id, second);
        assert_eq!(records["orders"].status, ModelStatus::Failed);
        assert_eq!(records["customers"].run_id, first);
    }

    #[test]
    fn file_recorder_writes_summary_and_log() {
        let dir = TempDir::new().unwrap();
        let recorder = FileRecorder::new(dir.path());
        let run_id = Uuid::new_v4();

        let results = vec![ModelRunResult::succeeded(
            "orders",
            Materialization::View,
            Utc::now(),
            "select 1".to_string(),
            false,
        )];
        let summary = RunSummary::from_results(run_id, Utc::now(), results, false);

        recorder.log(&run_id, "run started").unwrap();
        recorder.log(&run_id, "run finished").unwrap();
        recorder.record_summary(&summary).unwrap();

        let loaded = recorder.load_summary(&run_id).unwrap();
        assert_eq!(loaded.run_id, run_id);
        pretty_assertions::assert_eq!(loaded.summary, summary.summary);
        assert_eq!(loaded.results[0].rendered_sql.as_deref(), Some("select 1"));

        let log = std::fs::read_to_string(recorder.run_dir(&run_id).join(RUN_LOG_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("run started"));
        assert!(lines[1].ends_with("run finished"));
    }

    #[test]
    fn batched_records_and_lines_are_written_once() {
        let dir = TempDir::new().unwrap();
        let recorder = FileRecorder::new(dir.path());
        let run_id = Uuid::new_v4();

        recorder
            .record_models(&[
                record("orders", run_id, ModelStatus::Succeeded),
                record("customers", run_id, ModelStatus::Failed),
            ])
            .unwrap();
        recorder
            .log_all(&run_id, &["level 0: customers, orders".to_string(), "orders succeeded".to_string()])
            .unwrap();

        let records = recorder.load_model_runs().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["customers"].status, ModelStatus::Failed);

        let log = std::fs::read_to_string(recorder.run_dir(&run_id).join(RUN_LOG_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("level 0: customers, orders"));
        assert!(lines[1].ends_with("orders succeeded"));
    }

    #[test]
    fn empty_batches_touch_nothing() {
        let dir = TempDir::new().unwrap();
        let recorder = FileRecorder::new(dir.path().join("out"));

        recorder.record_models(&[]).unwrap();
        recorder.log_all(&Uuid::new_v4(), &[]).unwrap();
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn missing_model_runs_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let recorder = FileRecorder::new(dir.path().join("never-written"));
        assert!(recorder.load_model_runs().unwrap().is_empty());
    }

    #[test]
    fn corrupt_model_runs_file_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MODEL_RUNS_FILE), "not json").unwrap();

        let recorder = FileRecorder::new(dir.path());
        assert!(matches!(recorder.load_model_runs(), Err(RecorderError::Corrupt { .. })));
    }

    #[test]
    fn memory_recorder_filters_log_by_run() {
        let recorder = MemoryRecorder::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        recorder.log(&a, "one").unwrap();
        recorder.log(&b, "other").unwrap();
        recorder.log(&a, "two").unwrap();

        assert_eq!(recorder.log_lines(&a), vec!["one".to_string(), "two".to_string()]);
        assert_eq!(recorder.log_lines(&b), vec!["other".to_string()]);
    }
}
