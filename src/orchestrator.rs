//! Pipeline Orchestrator
//!
//! Drives one question (or a batch) through schema load, context retrieval,
//! SQL generation, guarding and execution, and assembles the result records.

use crate::config::{Config, ConfigUpdate};
use crate::db::{ConnectorFactory, DatabaseConnector, DefaultConnectorFactory};
use crate::dialect::Dialect;
use crate::error::{ErrorKind, Result, Text2SqlError};
use crate::executor::QueryExecutor;
use crate::guard::{self, suggest_missing_terms, Rejection, SqlGuard};
use crate::llm::{CompletionService, OpenAiCompatibleClient, SqlGenerator};
use crate::schema::{SchemaCatalog, SchemaSnapshot};
use crate::schema_rag::{load_docs_from_dir, ContextIndex, Embedder, OpenAiEmbedder};
use indexmap::IndexMap;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_ROW_LIMIT: usize = 100;

/// Pipeline checkpoints reported to a `ProgressListener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SchemaLoaded,
    ContextBuilt,
    Generated,
    SemanticChecked,
    Validated,
    Explained,
    Executed,
    DryRun,
    Done,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::SchemaLoaded => "schema loaded",
            Stage::ContextBuilt => "context built",
            Stage::Generated => "sql generated",
            Stage::SemanticChecked => "semantics checked",
            Stage::Validated => "sql validated",
            Stage::Explained => "plan fetched",
            Stage::Executed => "query executed",
            Stage::DryRun => "dry run",
            Stage::Done => "done",
        }
    }
}

pub trait ProgressListener: Send + Sync {
    fn on_stage(&self, stage: Stage);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressListener for NoopProgress {
    fn on_stage(&self, _stage: Stage) {}
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub question: String,
    pub limit: usize,
    pub explain: bool,
    pub dry_run: bool,
    pub show_schema: bool,
}

impl RunOptions {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            limit: DEFAULT_ROW_LIMIT,
            explain: false,
            dry_run: false,
            show_schema: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub limit: usize,
    pub dry_run: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_ROW_LIMIT,
            dry_run: false,
        }
    }
}

/// Result of one `run`. A guard rejection leaves `sql` empty and fills
/// `rejection` and `missing_terms`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub question: String,
    pub sql: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub plan_headers: Vec<String>,
    pub plan_rows: Vec<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<IndexMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Rejection> for RejectionInfo {
    fn from(rejection: &Rejection) -> Self {
        Self {
            kind: rejection.kind(),
            message: rejection.to_string(),
        }
    }
}

/// One record per batch input, tagged by `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemResult {
    Ok {
        index: usize,
        question: String,
        sql: String,
        headers: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Error {
        index: usize,
        question: String,
        kind: ErrorKind,
        message: String,
        missing_terms: Vec<String>,
    },
}

impl BatchItemResult {
    pub fn index(&self) -> usize {
        match self {
            BatchItemResult::Ok { index, .. } | BatchItemResult::Error { index, .. } => *index,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, BatchItemResult::Ok { .. })
    }
}

/// Connection summary for front ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseInfo {
    pub db: String,
    pub host: String,
    pub port: u16,
    pub dialect: Dialect,
    pub table_count: usize,
    pub tables: IndexMap<String, Vec<String>>,
}

pub struct Orchestrator {
    config: RwLock<Config>,
    catalog: SchemaCatalog,
    index: Mutex<ContextIndex>,
    generator: SqlGenerator,
    guard: SqlGuard,
    connectors: Arc<dyn ConnectorFactory>,
    progress: Arc<dyn ProgressListener>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        service: Arc<dyn CompletionService>,
        connectors: Arc<dyn ConnectorFactory>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let model = config.model_name.clone().unwrap_or_default();
        Self {
            catalog: SchemaCatalog::new(Some(config.db_info_dir.clone())),
            index: Mutex::new(ContextIndex::new(embedder)),
            generator: SqlGenerator::new(service, model),
            guard: SqlGuard::default(),
            connectors,
            progress: Arc::new(NoopProgress),
            config: RwLock::new(config),
        }
    }

    /// Production wiring: HTTP completion service, optional embeddings and
    /// the scheme-based connector factory.
    pub fn from_config(config: Config) -> Self {
        let api_key = config.api_key.clone().unwrap_or_else(|| {
            warn!("SILICONFLOW_API_KEY is not set; generation requests will be unauthenticated");
            String::new()
        });
        let service = Arc::new(OpenAiCompatibleClient::new(
            api_key.clone(),
            config.base_url.clone(),
        ));
        let embedder: Option<Arc<dyn Embedder>> = config.embedding_model.clone().map(|model| {
            Arc::new(OpenAiEmbedder::new(api_key, config.base_url.clone(), model)) as Arc<dyn Embedder>
        });
        Self::new(config, service, Arc::new(DefaultConnectorFactory), embedder)
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressListener>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_guard(mut self, guard: SqlGuard) -> Self {
        self.guard = guard;
        self
    }

    fn config(&self) -> RwLockReadGuard<'_, Config> {
        match self.config.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stage(&self, stage: Stage) {
        self.progress.on_stage(stage);
    }

    fn connector(&self) -> Result<(Arc<dyn DatabaseConnector>, Dialect)> {
        let url = self.config().require_db_url()?.to_string();
        let dialect = Dialect::from_url(&url);
        Ok((self.connectors.connector(&url)?, dialect))
    }

    fn executor(&self, connector: Arc<dyn DatabaseConnector>) -> QueryExecutor {
        QueryExecutor::new(connector, self.config().query_timeout)
    }

    fn ensure_model(&self) -> Result<()> {
        if self.generator.model().is_empty() {
            return Err(Text2SqlError::Config(
                "Missing MODEL_NAME. Set it in the environment or switch with -m".to_string(),
            ));
        }
        Ok(())
    }

    /// Schema docs plus any knowledge-base texts.
    fn grounding_documents(&self, schema: &SchemaSnapshot) -> Vec<String> {
        let mut documents = schema.docs.clone();
        let (kb_dir, kb_glob) = {
            let config = self.config();
            (config.kb_dir.clone(), config.kb_glob.clone())
        };
        if let Some(dir) = kb_dir {
            documents.extend(load_docs_from_dir(&dir, kb_glob.as_deref()));
        }
        documents
    }

    /// Rebuilds the shared index and returns the guard, so the caller's
    /// queries see this build and no other.
    async fn rebuild_index(&self, schema: &SchemaSnapshot) -> MutexGuard<'_, ContextIndex> {
        let documents = self.grounding_documents(schema);
        let mut index = self.index.lock().await;
        index.build(documents).await;
        index
    }

    pub async fn load_schema(&self) -> Result<SchemaSnapshot> {
        let (connector, _) = self.connector()?;
        self.catalog.load(connector.as_ref()).await
    }

    pub async fn run(&self, options: &RunOptions) -> Result<QueryOutcome> {
        let question = options.question.trim();
        if question.is_empty() {
            return Err(Text2SqlError::Config("Question is empty".to_string()));
        }
        self.ensure_model()?;

        let (connector, dialect) = self.connector()?;
        let schema = self.catalog.load(connector.as_ref()).await?;
        self.stage(Stage::SchemaLoaded);

        let mut outcome = QueryOutcome {
            question: question.to_string(),
            schema: options.show_schema.then(|| schema.tables.clone()),
            ..Default::default()
        };

        let top_k = self.config().top_k;
        let context = {
            let index = self.rebuild_index(&schema).await;
            index.query(question, top_k).await
        };
        self.stage(Stage::ContextBuilt);

        let candidate = self
            .generator
            .generate(question, &schema, dialect, options.limit, &context)
            .await?;
        self.stage(Stage::Generated);

        let checked = guard::check_sentinel(&candidate).and_then(|_| {
            guard::check_semantics(question, &candidate, &schema, self.guard.term_groups())
        });
        let validated = match checked {
            Ok(()) => {
                self.stage(Stage::SemanticChecked);
                guard::validate(&candidate, dialect)
            }
            Err(rejection) => Err(rejection),
        };
        let sql = match validated {
            Ok(sql) => sql,
            Err(rejection) => {
                warn!("Question rejected: {}", rejection);
                outcome.missing_terms = suggest_missing_terms(question, &schema);
                outcome.rejection = Some(RejectionInfo::from(&rejection));
                self.stage(Stage::Done);
                return Ok(outcome);
            }
        };
        self.stage(Stage::Validated);
        outcome.sql = Some(sql.to_string());

        let executor = self.executor(connector);
        if options.explain {
            let plan = executor.explain(&sql).await?;
            outcome.plan_headers = plan.headers;
            outcome.plan_rows = plan.rows;
            self.stage(Stage::Explained);
        }

        if options.dry_run {
            self.stage(Stage::DryRun);
        } else {
            let result = executor.query(&sql).await?;
            outcome.headers = result.headers;
            outcome.rows = result.rows;
            self.stage(Stage::Executed);
        }

        self.stage(Stage::Done);
        Ok(outcome)
    }

    /// Runs every question in order. Only the shared setup can fail the
    /// whole batch; per-question failures become `BatchItemResult::Error`.
    pub async fn run_batch(
        &self,
        questions: &[String],
        options: BatchOptions,
    ) -> Result<Vec<BatchItemResult>> {
        let batch_id = Uuid::new_v4();
        info!("Starting batch {} with {} questions", batch_id, questions.len());
        let (connector, dialect) = self.connector()?;
        let schema = self.catalog.load(connector.as_ref()).await?;
        self.stage(Stage::SchemaLoaded);
        // Held for the whole loop: every item queries the batch's own build.
        let context_index = self.rebuild_index(&schema).await;
        self.stage(Stage::ContextBuilt);
        let executor = self.executor(connector);

        let mut results = Vec::with_capacity(questions.len());
        for (index, question) in questions.iter().enumerate() {
            let question = question.trim();
            let item = match self
                .run_batch_item(&context_index, &executor, &schema, dialect, question, options)
                .await
            {
                Ok((sql, headers, rows)) => BatchItemResult::Ok {
                    index,
                    question: question.to_string(),
                    sql,
                    headers,
                    rows,
                },
                Err(e) => {
                    let kind = if question.is_empty() {
                        ErrorKind::MissingQuestion
                    } else {
                        e.kind()
                    };
                    warn!("Batch {} item {} failed: {}", batch_id, index, e);
                    BatchItemResult::Error {
                        index,
                        question: question.to_string(),
                        kind,
                        message: e.to_string(),
                        missing_terms: suggest_missing_terms(question, &schema),
                    }
                }
            };
            results.push(item);
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            "Batch {} finished: {} questions, {} failed",
            batch_id,
            results.len(),
            failed
        );
        self.stage(Stage::Done);
        Ok(results)
    }

    async fn run_batch_item(
        &self,
        index: &ContextIndex,
        executor: &QueryExecutor,
        schema: &SchemaSnapshot,
        dialect: Dialect,
        question: &str,
        options: BatchOptions,
    ) -> Result<(String, Vec<String>, Vec<Vec<serde_json::Value>>)> {
        if question.is_empty() {
            return Err(Text2SqlError::Config("Missing question".to_string()));
        }
        self.ensure_model()?;

        let top_k = self.config().top_k;
        let context = index.query(question, top_k).await;
        let candidate = self
            .generator
            .generate(question, schema, dialect, options.limit, &context)
            .await?;
        let sql = self.guard.check(question, &candidate, schema, dialect)?;

        if options.dry_run {
            return Ok((sql.into_inner(), Vec::new(), Vec::new()));
        }
        let result = executor.query(&sql).await?;
        Ok((sql.into_inner(), result.headers, result.rows))
    }

    /// Batch input from a JSON array or a CSV file with a `question` column.
    pub async fn run_batch_file(
        &self,
        path: &Path,
        options: BatchOptions,
    ) -> Result<Vec<BatchItemResult>> {
        let questions = read_questions(path)?;
        info!("Read {} questions from {}", questions.len(), path.display());
        self.run_batch(&questions, options).await
    }

    /// Replaces connection and knowledge settings for subsequent runs.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        let mut config = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = config.clone();
        next.apply(update)?;
        if let Some(ref url) = next.db_url {
            self.catalog.invalidate(url);
        }
        *config = next;
        info!("Configuration updated");
        Ok(())
    }

    pub async fn database_info(&self) -> Result<DatabaseInfo> {
        let (connector, dialect) = self.connector()?;
        let schema = self.catalog.load(connector.as_ref()).await?;
        let descriptor = connector.descriptor();
        Ok(DatabaseInfo {
            db: descriptor.database.clone(),
            host: descriptor.host.clone(),
            port: descriptor.port,
            dialect,
            table_count: schema.table_count(),
            tables: schema.tables,
        })
    }

    pub fn reconfigure_model(&self, model_name: &str) {
        self.generator.reconfigure_model(model_name);
    }

    pub fn model(&self) -> String {
        self.generator.model()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuestionEntry {
    Text(String),
    Object {
        #[serde(default)]
        question: Option<String>,
    },
    Other(IgnoredAny),
}

/// Questions in file order. Entries without a question become empty strings
/// so they still produce a result record.
pub fn read_questions(path: &Path) -> Result<Vec<String>> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        let mut reader = csv::Reader::from_path(path)?;
        let column = reader
            .headers()?
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case("question"))
            .ok_or_else(|| {
                Text2SqlError::Config(format!("{} has no 'question' column", path.display()))
            })?;
        let mut questions = Vec::new();
        for record in reader.records() {
            let record = record?;
            questions.push(record.get(column).unwrap_or_default().to_string());
        }
        return Ok(questions);
    }

    let text = std::fs::read_to_string(path)?;
    let entries: Vec<QuestionEntry> = serde_json::from_str(&text)?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            QuestionEntry::Text(q) => q,
            QuestionEntry::Object { question } => question.unwrap_or_default(),
            QuestionEntry::Other(_) => String::new(),
        })
        .collect())
}
