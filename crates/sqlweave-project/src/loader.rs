//! Project loading
//!
//! Reads `sources.toml` and every `models/**/*.sql` file under a project
//! root into a [`Catalog`]. The catalog is the only shared state: every later
//! stage receives it explicitly.

use serde::Deserialize;
use sqlweave_core::{
    template_checksum, Config, Diagnostic, ErrorCode, Layer, Location, Materialization, Relation,
    TargetConfig,
};
use sqlweave_template::{extract_config, extract_references, InvalidConfig, Reference, RelationResolver};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SOURCES_FILE: &str = "sources.toml";
pub const MODELS_DIR: &str = "models";

/// A templated query definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDefinition {
    /// Model name (file stem)
    pub name: String,

    /// Path relative to the project root
    pub path: PathBuf,

    pub raw_template: String,

    pub materialization: Materialization,

    /// Set iff the model is incremental
    pub unique_key: Option<String>,

    pub layer: Layer,

    /// SHA-256 of `raw_template`
    pub checksum: String,
}

impl ModelDefinition {
    /// Path as used in diagnostics
    pub fn file(&self) -> String {
        self.path.display().to_string()
    }
}

/// A declared table owned outside the project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefinition {
    pub namespace: String,
    pub name: String,
    pub database: Option<String>,
    pub schema: String,

    /// Physical table name, defaults to `name`
    pub table: String,
}

impl SourceDefinition {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, schema: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            table: name.clone(),
            name,
            database: None,
            schema: schema.into(),
        }
    }

    pub fn relation(&self) -> Relation {
        let relation = Relation::new(&self.schema, &self.table);
        match &self.database {
            Some(database) => relation.with_database(database),
            None => relation,
        }
    }
}

/// One entry of `sources.toml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceEntry {
    name: String,
    #[serde(default)]
    database: Option<String>,
    schema: String,
    #[serde(default)]
    identifier: Option<String>,
}

/// Errors that stop a project from loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("models directory not found: {0}")]
    MissingModelsDir(String),

    #[error("failed to parse {path}: {message}")]
    SourcesParse { path: String, message: String },

    #[error("source '{namespace}.{name}' is declared more than once")]
    DuplicateSource { namespace: String, name: String },

    #[error("model '{name}' is defined twice: {first} and {second}")]
    DuplicateModel { name: String, first: String, second: String },

    #[error("invalid config in {}", .0)]
    InvalidConfig(#[from] InvalidConfig),

    #[error("{file}:{line}: source namespace '{namespace}' is not declared in sources.toml")]
    UndeclaredNamespace { file: String, line: usize, namespace: String },
}

impl LoadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LoadError::Io { .. }
            | LoadError::MissingModelsDir(_)
            | LoadError::SourcesParse { .. }
            | LoadError::DuplicateSource { .. } => ErrorCode::LoadError,
            LoadError::DuplicateModel { .. } => ErrorCode::DuplicateModel,
            LoadError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            LoadError::UndeclaredNamespace { .. } => ErrorCode::UndeclaredSourceNamespace,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::error(self.code(), self.to_string());
        match self {
            LoadError::Io { path, .. } | LoadError::SourcesParse { path, .. } => {
                diagnostic.with_location(Location::new(path))
            }
            LoadError::DuplicateModel { name, second, .. } => diagnostic
                .with_location(Location::new(second))
                .with_model(name),
            LoadError::InvalidConfig(err) => {
                diagnostic.with_location(Location::with_line(&err.file, err.line))
            }
            LoadError::UndeclaredNamespace { file, line, .. } => {
                diagnostic.with_location(Location::with_line(file, *line))
            }
            _ => diagnostic,
        }
    }
}

/// Every model and source of a project, plus target settings
#[derive(Debug, Clone)]
pub struct Catalog {
    models: BTreeMap<String, ModelDefinition>,

    /// namespace -> source name -> definition
    sources: BTreeMap<String, BTreeMap<String, SourceDefinition>>,

    target: TargetConfig,
    vars: BTreeMap<String, String>,
}

impl Catalog {
    /// Load a project directory
    pub fn load(root: &Path, config: &Config) -> Result<Self, LoadError> {
        let sources = load_sources(root)?;

        let models_dir = root.join(MODELS_DIR);
        if !models_dir.is_dir() {
            return Err(LoadError::MissingModelsDir(models_dir.display().to_string()));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&models_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| LoadError::Io {
                path: models_dir.display().to_string(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }

            let raw = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            files.push((relative, raw));
        }

        let catalog = Self::assemble(files, sources, config)?;
        tracing::info!(
            root = %root.display(),
            models = catalog.models.len(),
            sources = catalog.source_count(),
            "project loaded"
        );
        Ok(catalog)
    }

    /// Build a catalog from in-memory definitions.
    ///
    /// Each model is given the path `models/<name>.sql` for diagnostics and
    /// goes through the same validation as [`Catalog::load`].
    pub fn from_parts<N, R>(
        models: impl IntoIterator<Item = (N, R)>,
        sources: impl IntoIterator<Item = SourceDefinition>,
        config: &Config,
    ) -> Result<Self, LoadError>
    where
        N: Into<String>,
        R: Into<String>,
    {
        let mut by_namespace: BTreeMap<String, BTreeMap<String, SourceDefinition>> = BTreeMap::new();
        for source in sources {
            insert_source(&mut by_namespace, source)?;
        }

        let files: Vec<(PathBuf, String)> = models
            .into_iter()
            .map(|(name, raw)| {
                let name: String = name.into();
                (Path::new(MODELS_DIR).join(format!("{}.sql", name)), raw.into())
            })
            .collect();

        Self::assemble(files, by_namespace, config)
    }

    fn assemble(
        files: Vec<(PathBuf, String)>,
        sources: BTreeMap<String, BTreeMap<String, SourceDefinition>>,
        config: &Config,
    ) -> Result<Self, LoadError> {
        let mut models: BTreeMap<String, ModelDefinition> = BTreeMap::new();

        for (path, raw) in files {
            let model = define_model(path, raw)?;
            check_namespaces(&model, &sources)?;

            if let Some(existing) = models.get(&model.name) {
                return Err(LoadError::DuplicateModel {
                    name: model.name.clone(),
                    first: existing.file(),
                    second: model.file(),
                });
            }
            tracing::debug!(
                model = %model.name,
                materialization = %model.materialization,
                "model defined"
            );
            models.insert(model.name.clone(), model);
        }

        Ok(Self {
            models,
            sources,
            target: config.target.clone(),
            vars: config.vars.clone(),
        })
    }

    /// Models in name order
    pub fn models(&self) -> impl Iterator<Item = &ModelDefinition> {
        self.models.values()
    }

    pub fn model(&self, name: &str) -> Option<&ModelDefinition> {
        self.models.get(name)
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Sources in (namespace, name) order
    pub fn sources(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.sources.values().flat_map(|tables| tables.values())
    }

    pub fn source(&self, namespace: &str, name: &str) -> Option<&SourceDefinition> {
        self.sources.get(namespace).and_then(|tables| tables.get(name))
    }

    fn source_count(&self) -> usize {
        self.sources.values().map(BTreeMap::len).sum()
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Relation a model materializes into
    pub fn model_relation(&self, name: &str) -> Option<Relation> {
        self.models.get(name).map(|model| self.relation_for(&model.name))
    }

    fn relation_for(&self, name: &str) -> Relation {
        let relation = Relation::new(&self.target.schema, name);
        match &self.target.database {
            Some(database) => relation.with_database(database),
            None => relation,
        }
    }
}

impl RelationResolver for Catalog {
    fn resolve_model(&self, name: &str) -> Option<Relation> {
        self.model_relation(name)
    }

    fn resolve_source(&self, namespace: &str, table: &str) -> Option<Relation> {
        self.source(namespace, table).map(SourceDefinition::relation)
    }
}

fn load_sources(root: &Path) -> Result<BTreeMap<String, BTreeMap<String, SourceDefinition>>, LoadError> {
    let path = root.join(SOURCES_FILE);
    let mut sources = BTreeMap::new();

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no source declarations");
        return Ok(sources);
    }

    let contents = std::fs::read_to_string(&path).map_err(|e| LoadError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let parsed: BTreeMap<String, Vec<SourceEntry>> =
        toml::from_str(&contents).map_err(|e| LoadError::SourcesParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    for (namespace, entries) in parsed {
        // An empty list still declares the namespace
        sources.entry(namespace.clone()).or_default();

        for entry in entries {
            let source = SourceDefinition {
                namespace: namespace.clone(),
                table: entry.identifier.unwrap_or_else(|| entry.name.clone()),
                name: entry.name,
                database: entry.database,
                schema: entry.schema,
            };
            insert_source(&mut sources, source)?;
        }
    }

    Ok(sources)
}

fn insert_source(
    sources: &mut BTreeMap<String, BTreeMap<String, SourceDefinition>>,
    source: SourceDefinition,
) -> Result<(), LoadError> {
    let tables = sources.entry(source.namespace.clone()).or_default();
    if tables.contains_key(&source.name) {
        return Err(LoadError::DuplicateSource {
            namespace: source.namespace,
            name: source.name,
        });
    }
    tables.insert(source.name.clone(), source);
    Ok(())
}

fn define_model(path: PathBuf, raw: String) -> Result<ModelDefinition, LoadError> {
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| LoadError::Io {
            path: path.display().to_string(),
            message: "model file name is not valid UTF-8".to_string(),
        })?;

    let file = path.display().to_string();
    let config = extract_config(&file, &raw)?.unwrap_or_default();

    Ok(ModelDefinition {
        layer: Layer::from_model_name(&name),
        checksum: template_checksum(&raw),
        name,
        path,
        raw_template: raw,
        materialization: config.materialization,
        unique_key: config.unique_key,
    })
}

/// Every `source()` namespace must be declared. Templates that do not parse
/// are left for the renderer to report.
fn check_namespaces(
    model: &ModelDefinition,
    sources: &BTreeMap<String, BTreeMap<String, SourceDefinition>>,
) -> Result<(), LoadError> {
    let file = model.file();
    let Ok(references) = extract_references(&file, &model.raw_template) else {
        return Ok(());
    };

    for reference in references {
        if let Reference::Source { namespace, line, .. } = reference {
            if !sources.contains_key(&namespace) {
                return Err(LoadError::UndeclaredNamespace { file, line, namespace });
            }
        }
    }
    Ok(())
}
