use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sqlweave_core::{Config, Diagnostic, EngineSettings, ModelStatus, RunSummary, SelectionPolicy};
use sqlweave_engine::{CancellationHandle, Engine, FileRecorder};
use sqlweave_project::{Catalog, ExecutionPlan, Selection};
use sqlweave_store::{MemoryStore, PostgresStore, RelationalStore};
use sqlweave_template::{render_str, RenderContext};

const CONFIG_FILE: &str = "sqlweave.toml";
const DATABASE_URL_VAR: &str = "SQLWEAVE_DATABASE_URL";
const COMPILED_DIR: &str = "compiled";

/// sqlweave - build SQL models into tables and views
#[derive(Parser)]
#[command(name = "sqlweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(short, long, global = true)]
    project_dir: Option<PathBuf>,

    /// Path to config file (default: <project>/sqlweave.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct SelectArgs {
    /// Comma-separated models to run (default: all)
    #[arg(short, long)]
    select: Option<String>,

    /// Run only the selected models; their upstream must already be built
    #[arg(long)]
    exact: bool,
}

impl SelectArgs {
    fn selection(&self) -> Selection {
        self.select.as_deref().map(Selection::parse).unwrap_or_default()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build models against the database
    Run {
        #[command(flatten)]
        select: SelectArgs,

        /// Rebuild incremental models from scratch
        #[arg(long)]
        full_refresh: bool,

        /// Stop after the first level with a failure
        #[arg(long)]
        fail_fast: bool,

        /// Maximum concurrent models per level
        #[arg(short, long)]
        workers: Option<usize>,

        /// Execute against an in-memory store and print the statements
        #[arg(long)]
        dry_run: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the execution levels
    Plan {
        #[command(flatten)]
        select: SelectArgs,
    },

    /// Render models to SQL without executing them
    Compile {
        #[command(flatten)]
        select: SelectArgs,

        /// Print rendered SQL instead of writing files
        #[arg(long)]
        stdout: bool,
    },

    /// List models and sources
    Ls,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let config = load_config(&project_dir, cli.config.as_deref(), cli.verbose)?;

    let catalog = Catalog::load(&project_dir, &config).map_err(|e| fatal(e.to_diagnostic()))?;
    if cli.verbose {
        eprintln!(
            "{} {} models from {}",
            "Loaded".cyan(),
            catalog.len(),
            project_dir.display()
        );
    }

    match cli.command {
        Commands::Run {
            select,
            full_refresh,
            fail_fast,
            workers,
            dry_run,
            json,
        } => {
            let settings = RunOverrides {
                exact: select.exact,
                full_refresh,
                fail_fast,
                workers,
            }
            .apply(&config.engine);
            run_command(&config, catalog, settings, &select.selection(), dry_run, json, cli.verbose).await
        }
        Commands::Plan { select } => plan_command(&catalog, &select),
        Commands::Compile { select, stdout } => compile_command(&config, &catalog, &select, stdout),
        Commands::Ls => ls_command(&catalog),
    }
}

/// Install the stderr subscriber; `RUST_LOG` wins over `--verbose`
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(project_dir: &Path, explicit: Option<&Path>, verbose: bool) -> Result<Config> {
    let default_path = project_dir.join(CONFIG_FILE);

    let config = if let Some(path) = explicit {
        Config::from_file(path)?
    } else if default_path.exists() {
        Config::from_file(&default_path)?
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config {
            project_root: project_dir.to_path_buf(),
            ..Config::default()
        }
    };

    if verbose {
        eprintln!("{} schema: {}", "Target".cyan(), config.target.schema);
    }
    Ok(config)
}

fn fatal(diagnostic: Diagnostic) -> anyhow::Error {
    anyhow::anyhow!("{}", diagnostic)
}

/// Command-line overrides of the configured engine settings
#[derive(Debug, Default)]
struct RunOverrides {
    exact: bool,
    full_refresh: bool,
    fail_fast: bool,
    workers: Option<usize>,
}

impl RunOverrides {
    fn apply(&self, base: &EngineSettings) -> EngineSettings {
        let mut settings = base.clone();
        if self.exact {
            settings.selection_policy = SelectionPolicy::Exact;
        }
        settings.full_refresh |= self.full_refresh;
        settings.fail_fast |= self.fail_fast;
        if let Some(workers) = self.workers {
            settings.max_workers = workers.max(1);
        }
        settings
    }
}

async fn connect(pool_size: usize) -> Result<PostgresStore> {
    let url = std::env::var(DATABASE_URL_VAR).map_err(|_| {
        anyhow::anyhow!(
            "{} is not set. Export a PostgreSQL connection string or use --dry-run.",
            DATABASE_URL_VAR
        )
    })?;

    let store = if url.contains("sslmode=require") {
        PostgresStore::from_connection_string_with_tls(&url, pool_size).await
    } else {
        PostgresStore::from_connection_string(&url, pool_size).await
    };
    store.map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))
}

async fn run_command(
    config: &Config,
    catalog: Catalog,
    settings: EngineSettings,
    selection: &Selection,
    dry_run: bool,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let memory = dry_run.then(MemoryStore::new);
    let store: Arc<dyn RelationalStore> = match &memory {
        Some(memory) => Arc::new(memory.clone()),
        None => Arc::new(connect(settings.max_workers).await?),
    };

    if verbose {
        eprintln!("{} {} store", "Using".cyan(), store.name());
    }

    let mut engine = Engine::new(Arc::new(catalog), store, settings);
    if !dry_run {
        engine = engine.with_recorder(Arc::new(FileRecorder::new(config.output_dir())));
    }

    let cancellation = CancellationHandle::new();
    let handle = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, finishing models in flight...".yellow());
            handle.cancel();
        }
    });

    let summary = engine
        .execute_cancellable(selection, &cancellation)
        .await
        .map_err(|e| fatal(e.to_diagnostic()))?;

    if let Some(memory) = memory {
        println!("{}", "Statements (dry run):".bold());
        for statement in memory.statements().await {
            println!("  {};", statement);
        }
        println!();
    }

    if json {
        println!("{}", summary.to_json()?);
    } else {
        print_run_summary(&summary);
    }

    if summary.has_failures() || summary.cancelled {
        std::process::exit(1);
    }

    Ok(())
}

fn plan_command(catalog: &Catalog, select: &SelectArgs) -> Result<()> {
    let policy = if select.exact {
        SelectionPolicy::Exact
    } else {
        SelectionPolicy::WithUpstream
    };
    let plan = ExecutionPlan::build_for(catalog, &select.selection(), policy).map_err(|e| fatal(e.to_diagnostic()))?;

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Execution Plan".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    for (index, level) in plan.levels().iter().enumerate() {
        println!("{} {}", "Level".bold(), index);
        for name in level {
            let materialization = catalog
                .model(name)
                .map(|m| m.materialization.to_string())
                .unwrap_or_default();
            println!("  {} ({})", name.green(), materialization);
        }
    }

    let external = plan.external_models();
    if !external.is_empty() {
        println!();
        println!("{}", "Must already be built:".bold());
        for name in external {
            println!("  {}", name.yellow());
        }
    }

    println!();
    println!("{} models in {} levels", plan.len(), plan.levels().len());
    Ok(())
}

fn compile_command(config: &Config, catalog: &Catalog, select: &SelectArgs, stdout: bool) -> Result<()> {
    let policy = if select.exact {
        SelectionPolicy::Exact
    } else {
        SelectionPolicy::WithUpstream
    };
    let plan = ExecutionPlan::build_for(catalog, &select.selection(), policy).map_err(|e| fatal(e.to_diagnostic()))?;
    let compiled_dir = config.output_dir().join(COMPILED_DIR);

    let mut failures = 0;
    for name in plan.models() {
        let (Some(model), Some(relation)) = (catalog.model(name), catalog.model_relation(name)) else {
            continue;
        };

        let context = RenderContext::new(catalog, relation).with_vars(catalog.vars());
        let rendered = match render_str(&model.file(), &model.raw_template, &context) {
            Ok(rendered) => rendered,
            Err(e) => {
                eprintln!("  [{}] {}", "ERROR".red().bold(), fatal(e.to_diagnostic().with_model(name)));
                failures += 1;
                continue;
            }
        };

        if stdout {
            println!("-- {}", name.bold());
            println!("{};\n", rendered.sql);
        } else {
            std::fs::create_dir_all(&compiled_dir)?;
            let path = compiled_dir.join(format!("{}.sql", name));
            std::fs::write(&path, format!("{}\n", rendered.sql))?;
            println!("  {} {}", "✓".green(), path.display());
        }
    }

    if failures > 0 {
        eprintln!("{} {} models failed to render", "✗".red(), failures);
        std::process::exit(1);
    }
    Ok(())
}

fn ls_command(catalog: &Catalog) -> Result<()> {
    println!("{}", "Models:".bold());
    for model in catalog.models() {
        let key = model
            .unique_key
            .as_deref()
            .map(|k| format!(", unique_key={}", k))
            .unwrap_or_default();
        println!(
            "  {:<32} {:<12} {:<13} {}{}",
            model.name.green(),
            model.materialization.to_string(),
            model.layer.to_string(),
            model.file(),
            key
        );
    }

    println!();
    println!("{}", "Sources:".bold());
    for source in catalog.sources() {
        println!(
            "  {:<32} {}",
            format!("{}.{}", source.namespace, source.name).cyan(),
            source.relation()
        );
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Run Summary".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Run: {}", summary.run_id);
    println!("Timestamp: {}", summary.timestamp);
    println!();

    for result in &summary.results {
        let status = match result.status {
            ModelStatus::Succeeded => "OK".green().bold(),
            ModelStatus::Failed => "FAIL".red().bold(),
            ModelStatus::Skipped => "SKIP".yellow().bold(),
        };
        let incremental = if result.is_incremental { " (incremental)" } else { "" };
        println!(
            "  [{}] {} {}{} {:.2}s",
            status, result.model_name, result.materialization, incremental, result.duration
        );
        if let Some(error) = &result.error {
            let code = result.error_code.map(|c| c.to_string()).unwrap_or_default();
            println!("         {} {}", code.dimmed(), error);
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  Models:    {}", summary.summary.total_models);
    println!("  Succeeded: {}", summary.summary.successes.to_string().green());
    if summary.summary.failures > 0 {
        println!("  Failed:    {}", summary.summary.failures.to_string().red().bold());
    } else {
        println!("  Failed:    {}", summary.summary.failures.to_string().green());
    }
    if summary.summary.skipped > 0 {
        println!("  Skipped:   {}", summary.summary.skipped.to_string().yellow());
    } else {
        println!("  Skipped:   {}", summary.summary.skipped);
    }
    println!("  Duration:  {:.2}s", summary.total_duration);

    if summary.cancelled {
        println!();
        println!("{}", "⚠ Run was cancelled".yellow().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments() {
        let cli = Cli::try_parse_from([
            "sqlweave",
            "run",
            "--select",
            "stg_orders, fct_orders",
            "--exact",
            "--full-refresh",
            "-w",
            "2",
        ])
        .unwrap();

        let Commands::Run {
            select,
            full_refresh,
            workers,
            dry_run,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(select.selection(), Selection::models(["stg_orders", "fct_orders"]));
        assert!(select.exact);
        assert!(full_refresh);
        assert_eq!(workers, Some(2));
        assert!(!dry_run);
    }

    #[test]
    fn missing_select_means_all() {
        assert_eq!(SelectArgs::default().selection(), Selection::All);
    }

    #[test]
    fn overrides_only_tighten_settings() {
        let base = EngineSettings {
            fail_fast: true,
            ..EngineSettings::default()
        };

        let settings = RunOverrides::default().apply(&base);
        assert_eq!(settings, base);

        let settings = RunOverrides {
            exact: true,
            full_refresh: true,
            fail_fast: false,
            workers: Some(0),
        }
        .apply(&base);
        assert_eq!(settings.selection_policy, SelectionPolicy::Exact);
        assert!(settings.full_refresh);
        assert!(settings.fail_fast);
        assert_eq!(settings.max_workers, 1);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sqlweave", "plan", "--verbose", "-p", "demo"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.project_dir, Some(PathBuf::from("demo")));
    }
}
