//! Execution engine
//!
//! Runs an [`ExecutionPlan`] against a [`RelationalStore`], one level at a
//! time. Models within a level run concurrently, bounded by
//! `max_workers`; a level only starts once every model of the previous level
//! has reached a terminal status.
//!
//! Each model goes through `pending -> rendering -> executing` and ends
//! `succeeded`, `failed` or `skipped`:
//!
//! 1. Upstream models not in the plan are probed; absent ones fail the model.
//! 2. The target relation is probed to decide `is_incremental()`.
//! 3. The template is rendered against the catalog.
//! 4. The materialization statements are executed.
//!
//! A failure never aborts the run: downstream models are skipped and
//! independent branches carry on. Run-level problems (unknown selection,
//! cycles, an unreachable store) are returned as [`EngineError`] before any
//! model is attempted.

use crate::cancel::CancellationHandle;
use crate::materialize::{self, Statements};
use crate::recorder::{RecorderError, RunRecorder};
use chrono::{DateTime, Utc};
use sqlweave_core::{
    Diagnostic, EngineSettings, ErrorCode, Materialization, ModelRunRecord, ModelRunResult, ModelStatus,
    RunSummary,
};
use sqlweave_project::{Catalog, ExecutionPlan, GraphError, ModelDefinition, Selection};
use sqlweave_store::{RelationalStore, StoreError};
use sqlweave_template::{render_str, RenderContext};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

/// Errors that stop a run before any model is attempted
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] GraphError),

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Plan(err) => err.code(),
            Self::Store(_) => ErrorCode::ExecutionError,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Plan(err) => err.to_diagnostic(),
            Self::Store(err) => Diagnostic::error(self.code(), err.to_string()),
        }
    }
}

/// Lifecycle of a model within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPhase {
    Pending,
    Rendering,
    Executing,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for ModelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Rendering => "rendering",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

fn transition(model: &str, from: ModelPhase, to: ModelPhase) {
    tracing::debug!(model, from = %from, to = %to, "model phase");
}

/// Why the remaining levels were not started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    FailFast,
}

impl Halt {
    fn diagnostic(self, model: &str) -> Diagnostic {
        let diagnostic = match self {
            Halt::Cancelled => Diagnostic::error(ErrorCode::RunCancelled, "run cancelled"),
            Halt::FailFast => Diagnostic::error(
                ErrorCode::UpstreamFailed,
                "not started: an earlier level failed and fail_fast is set",
            ),
        };
        diagnostic.with_model(model)
    }
}

/// State shared by the model tasks of one run
struct RunShared {
    catalog: Arc<Catalog>,
    store: Arc<dyn RelationalStore>,
    settings: EngineSettings,
    cancellation: CancellationHandle,
    workers: Semaphore,
}

/// A model that rendered and executed
struct Built {
    sql: String,
    is_incremental: bool,
}

/// A model that stopped short, and where
struct Failure {
    phase: ModelPhase,
    diagnostic: Diagnostic,
    rendered_sql: Option<String>,
    is_incremental: bool,
}

impl Failure {
    fn new(phase: ModelPhase, diagnostic: Diagnostic) -> Self {
        Self {
            phase,
            diagnostic,
            rendered_sql: None,
            is_incremental: false,
        }
    }
}

/// Executes plans built from one catalog against one store
pub struct Engine {
    catalog: Arc<Catalog>,
    store: Arc<dyn RelationalStore>,
    settings: EngineSettings,
    recorder: Option<Arc<dyn RunRecorder>>,
}

impl Engine {
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn RelationalStore>, settings: EngineSettings) -> Self {
        Self {
            catalog,
            store,
            settings,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Plan a selection under the configured selection policy
    pub fn plan(&self, selection: &Selection) -> Result<ExecutionPlan, EngineError> {
        Ok(ExecutionPlan::build_for(
            &self.catalog,
            selection,
            self.settings.selection_policy,
        )?)
    }

    /// Plan, check the store is reachable, then run
    pub async fn execute(&self, selection: &Selection) -> Result<RunSummary, EngineError> {
        self.execute_cancellable(selection, &CancellationHandle::new()).await
    }

    /// Like [`Engine::execute`], stopping early once `cancellation` is raised.
    ///
    /// The handle belongs to this run only; other runs of the engine are
    /// unaffected by it.
    pub async fn execute_cancellable(
        &self,
        selection: &Selection,
        cancellation: &CancellationHandle,
    ) -> Result<RunSummary, EngineError> {
        let plan = self.plan(selection)?;
        self.store.test_connection().await?;
        Ok(self.execute_plan_cancellable(&plan, cancellation).await)
    }

    /// Run every model of `plan`.
    ///
    /// The summary holds one result per planned model, in execution order.
    pub async fn execute_plan(&self, plan: &ExecutionPlan) -> RunSummary {
        self.execute_plan_cancellable(plan, &CancellationHandle::new()).await
    }

    pub async fn execute_plan_cancellable(&self, plan: &ExecutionPlan, cancellation: &CancellationHandle) -> RunSummary {
        let run_id = Uuid::new_v4();
        let timestamp = Utc::now();
        let shared = Arc::new(RunShared {
            catalog: Arc::clone(&self.catalog),
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            cancellation: cancellation.clone(),
            workers: Semaphore::new(self.settings.max_workers.max(1)),
        });

        tracing::info!(
            run_id = %run_id,
            models = plan.len(),
            levels = plan.levels().len(),
            store = self.store.name(),
            "run started"
        );
        self.flush(
            run_id,
            vec![format!("run started: {} models in {} levels", plan.len(), plan.levels().len())],
            Vec::new(),
        )
        .await;

        let mut results: Vec<ModelRunResult> = Vec::with_capacity(plan.len());
        let mut statuses: HashMap<String, ModelStatus> = HashMap::new();
        let mut halt: Option<Halt> = None;
        let mut cancelled = false;

        for (index, level) in plan.levels().iter().enumerate() {
            if halt.is_none() && cancellation.is_cancelled() {
                tracing::info!(level = index, "run cancelled, skipping remaining levels");
                halt = Some(Halt::Cancelled);
            }

            let mut lines = Vec::with_capacity(level.len() + 1);
            let level_results = match halt {
                Some(reason) => level
                    .iter()
                    .map(|name| {
                        transition(name, ModelPhase::Pending, ModelPhase::Skipped);
                        ModelRunResult::skipped(name, self.materialization_of(name), &reason.diagnostic(name))
                    })
                    .collect(),
                None => {
                    lines.push(format!("level {}: {}", index, level.join(", ")));
                    self.execute_level(&shared, plan, index, level, &statuses).await
                }
            };

            let level_failed = level_results.iter().any(|r| r.status == ModelStatus::Failed);
            let mut records = Vec::new();
            for result in level_results {
                cancelled |= result.error_code == Some(ErrorCode::RunCancelled);
                lines.push(self.note(&result));
                records.extend(self.model_record(&run_id, &result));
                statuses.insert(result.model_name.clone(), result.status);
                results.push(result);
            }
            self.flush(run_id, lines, records).await;

            if level_failed && self.settings.fail_fast && halt.is_none() {
                tracing::info!(level = index, "fail_fast set, not starting further levels");
                halt = Some(Halt::FailFast);
            }
        }

        let summary = RunSummary::from_results(run_id, timestamp, results, cancelled);

        tracing::info!(
            run_id = %run_id,
            successes = summary.summary.successes,
            failures = summary.summary.failures,
            skipped = summary.summary.skipped,
            duration = summary.total_duration,
            cancelled,
            "run finished"
        );
        self.flush(
            run_id,
            vec![format!(
                "run finished: {} succeeded, {} failed, {} skipped in {:.2}s",
                summary.summary.successes, summary.summary.failures, summary.summary.skipped, summary.total_duration
            )],
            Vec::new(),
        )
        .await;

        let recorded = summary.clone();
        self.on_recorder(run_id, "record run summary", move |recorder| {
            recorder.record_summary(&recorded)
        })
        .await;

        summary
    }

    async fn execute_level(
        &self,
        shared: &Arc<RunShared>,
        plan: &ExecutionPlan,
        index: usize,
        level: &[String],
        statuses: &HashMap<String, ModelStatus>,
    ) -> Vec<ModelRunResult> {
        tracing::info!(level = index, models = level.len(), "level started");

        let mut results = Vec::with_capacity(level.len());
        let mut set = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for name in level {
            let Some(model) = self.catalog.model(name) else {
                let diagnostic = Diagnostic::error(
                    ErrorCode::ExecutionError,
                    format!("model '{}' is not in the catalog", name),
                )
                .with_model(name);
                results.push(ModelRunResult::failed(
                    name,
                    Materialization::default(),
                    Utc::now(),
                    &diagnostic,
                    None,
                    false,
                ));
                continue;
            };

            let blocked = plan.upstream(name).find_map(|upstream| match statuses.get(upstream) {
                Some(ModelStatus::Failed) => Some(format!("upstream '{}' failed", upstream)),
                Some(ModelStatus::Skipped) => Some(format!("upstream '{}' was skipped", upstream)),
                _ => None,
            });
            if let Some(reason) = blocked {
                transition(name, ModelPhase::Pending, ModelPhase::Skipped);
                let diagnostic = Diagnostic::error(ErrorCode::UpstreamFailed, reason).with_model(name);
                results.push(ModelRunResult::skipped(name, model.materialization, &diagnostic));
                continue;
            }

            let external: Vec<String> = plan.external_upstream(name).map(str::to_string).collect();
            let span = tracing::info_span!("model", model = %name);
            pending.insert(name.clone());
            set.spawn(run_model_task(Arc::clone(shared), model.clone(), external).instrument(span));
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    pending.remove(&result.model_name);
                    results.push(result);
                }
                Err(e) => tracing::warn!(level = index, error = %e, "model task join error"),
            }
        }

        // Tasks that panicked never reported back
        for name in pending {
            let diagnostic =
                Diagnostic::error(ErrorCode::ExecutionError, "model task aborted unexpectedly").with_model(&name);
            results.push(ModelRunResult::failed(
                &name,
                self.materialization_of(&name),
                Utc::now(),
                &diagnostic,
                None,
                false,
            ));
        }

        results.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        results
    }

    fn materialization_of(&self, name: &str) -> Materialization {
        self.catalog
            .model(name)
            .map(|m| m.materialization)
            .unwrap_or_default()
    }

    /// Log a finished model; returns its run-log line
    fn note(&self, result: &ModelRunResult) -> String {
        let error = result.error.as_deref().unwrap_or_default();
        match result.status {
            ModelStatus::Succeeded => {
                tracing::info!(model = %result.model_name, duration = result.duration, "model succeeded");
                format!("{} succeeded in {:.2}s", result.model_name, result.duration)
            }
            ModelStatus::Failed => {
                tracing::error!(model = %result.model_name, error, "model failed");
                format!("{} failed: {}", result.model_name, error)
            }
            ModelStatus::Skipped => {
                tracing::info!(model = %result.model_name, reason = error, "model skipped");
                format!("{} skipped: {}", result.model_name, error)
            }
        }
    }

    /// Metadata record for a model that was attempted
    fn model_record(&self, run_id: &Uuid, result: &ModelRunResult) -> Option<ModelRunRecord> {
        // Skipped models never touched their relation
        if self.recorder.is_none() || result.status == ModelStatus::Skipped {
            return None;
        }
        let model = self.catalog.model(&result.model_name)?;

        Some(ModelRunRecord {
            model_name: model.name.clone(),
            run_id: *run_id,
            status: result.status,
            materialization: model.materialization,
            relation: self
                .catalog
                .model_relation(&model.name)
                .map(|r| r.fqn())
                .unwrap_or_default(),
            template_checksum: model.checksum.clone(),
            finished_at: result.finished_at,
            duration: result.duration,
        })
    }

    /// Write log lines, then model records
    async fn flush(&self, run_id: Uuid, lines: Vec<String>, records: Vec<ModelRunRecord>) {
        self.on_recorder(run_id, "write run log and model records", move |recorder| {
            let logged = recorder.log_all(&run_id, &lines);
            let recorded = recorder.record_models(&records);
            logged.and(recorded)
        })
        .await;
    }

    /// Run a recorder call on the blocking pool; failures are only logged
    async fn on_recorder<F>(&self, run_id: Uuid, action: &'static str, call: F)
    where
        F: FnOnce(&dyn RunRecorder) -> Result<(), RecorderError> + Send + 'static,
    {
        let Some(recorder) = self.recorder.clone() else {
            return;
        };

        match tokio::task::spawn_blocking(move || call(recorder.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(run_id = %run_id, error = %e, "failed to {}", action),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "recorder task failed"),
        }
    }
}

/// Wait for a worker, then build the model under the per-model timeout
async fn run_model_task(shared: Arc<RunShared>, model: ModelDefinition, external: Vec<String>) -> ModelRunResult {
    // A closed semaphore means the run is being torn down
    let Ok(_permit) = shared.workers.acquire().await else {
        return ModelRunResult::skipped(&model.name, model.materialization, &Halt::Cancelled.diagnostic(&model.name));
    };

    if shared.cancellation.is_cancelled() {
        transition(&model.name, ModelPhase::Pending, ModelPhase::Skipped);
        return ModelRunResult::skipped(&model.name, model.materialization, &Halt::Cancelled.diagnostic(&model.name));
    }

    let started_at = Utc::now();
    let timeout = shared.settings.model_timeout();

    match tokio::time::timeout(timeout, run_model(&shared, &model, &external, started_at)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "model timed out");
            let diagnostic = Diagnostic::error(
                ErrorCode::ModelTimeout,
                format!("model '{}' exceeded the {}s timeout", model.name, timeout.as_secs()),
            )
            .with_model(&model.name);
            ModelRunResult::failed(&model.name, model.materialization, started_at, &diagnostic, None, false)
        }
    }
}

async fn run_model(
    shared: &RunShared,
    model: &ModelDefinition,
    external: &[String],
    started_at: DateTime<Utc>,
) -> ModelRunResult {
    match build_model(shared, model, external).await {
        Ok(built) => {
            transition(&model.name, ModelPhase::Executing, ModelPhase::Succeeded);
            ModelRunResult::succeeded(
                &model.name,
                model.materialization,
                started_at,
                built.sql,
                built.is_incremental,
            )
        }
        Err(failure) => {
            transition(&model.name, failure.phase, ModelPhase::Failed);
            ModelRunResult::failed(
                &model.name,
                model.materialization,
                started_at,
                &failure.diagnostic.with_model(&model.name),
                failure.rendered_sql,
                failure.is_incremental,
            )
        }
    }
}

async fn build_model(shared: &RunShared, model: &ModelDefinition, external: &[String]) -> Result<Built, Failure> {
    let store_failure = |phase, e: StoreError| Failure::new(phase, Diagnostic::error(ErrorCode::ExecutionError, e.to_string()));

    let relation = shared.catalog.model_relation(&model.name).ok_or_else(|| {
        Failure::new(
            ModelPhase::Pending,
            Diagnostic::error(ErrorCode::ExecutionError, format!("no relation for model '{}'", model.name)),
        )
    })?;

    for upstream in external {
        let missing = |detail: String| {
            Failure::new(
                ModelPhase::Pending,
                Diagnostic::error(
                    ErrorCode::MissingUpstream,
                    format!("upstream '{}' has not been built: {}", upstream, detail),
                ),
            )
        };
        let Some(upstream_relation) = shared.catalog.model_relation(upstream) else {
            return Err(missing("not in the catalog".to_string()));
        };
        let state = shared
            .store
            .relation_state(&upstream_relation)
            .await
            .map_err(|e| store_failure(ModelPhase::Pending, e))?;
        if !state.exists() {
            return Err(missing(format!("{} does not exist", upstream_relation)));
        }
    }

    let state = shared
        .store
        .relation_state(&relation)
        .await
        .map_err(|e| store_failure(ModelPhase::Pending, e))?;
    let full_refresh = shared.settings.full_refresh;
    let is_incremental = materialize::renders_incrementally(model.materialization, &state, full_refresh);

    transition(&model.name, ModelPhase::Pending, ModelPhase::Rendering);
    let rendered = {
        let context = RenderContext::new(shared.catalog.as_ref(), relation.clone())
            .incremental(is_incremental)
            .with_vars(shared.catalog.vars());
        render_str(&model.file(), &model.raw_template, &context).map_err(|e| Failure {
            is_incremental,
            ..Failure::new(ModelPhase::Rendering, e.to_diagnostic())
        })?
    };

    transition(&model.name, ModelPhase::Rendering, ModelPhase::Executing);
    let statements = materialize::statements(
        model.materialization,
        model.unique_key.as_deref(),
        &relation,
        &state,
        &rendered.sql,
        full_refresh,
    );
    tracing::debug!(
        relation = %relation,
        statements = statements.as_slice().len(),
        is_incremental,
        "executing materialization"
    );

    apply(shared.store.as_ref(), &statements).await.map_err(|e| Failure {
        rendered_sql: Some(rendered.sql.clone()),
        is_incremental,
        ..store_failure(ModelPhase::Executing, e)
    })?;

    Ok(Built {
        sql: rendered.sql,
        is_incremental,
    })
}

async fn apply(store: &dyn RelationalStore, statements: &Statements) -> Result<(), StoreError> {
    match statements {
        Statements::Sequential(list) => {
            for statement in list {
                store.execute(statement).await?;
            }
            Ok(())
        }
        Statements::Transaction(list) => store.execute_transaction(list).await,
    }
}
