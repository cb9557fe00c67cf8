//! Top-level driver: a one-time prepare phase followed by every scenario.

use crate::config::BenchConfig;
use crate::db::{Connector, PgConnector, StatementOutcome};
use crate::engine::{CrashSafeExecutor, ScenarioReport, ScenarioRunner, Statement, TrialStats, WorkerSession};
use crate::errors::BenchError;
use crate::report::print_latency_report;
use crate::sources::{GenerationContext, SourceSpec, SqlValue};
use crate::status::Status;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Database every cluster has; used to create the benchmark database.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Everything a run produced. `error` is the first fatal error, if any.
#[derive(Debug)]
pub struct RunSummary {
    pub scenarios: Vec<ScenarioReport>,
    pub trials: TrialStats,
    pub error: Option<anyhow::Error>,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Processor {
    config: BenchConfig,
    executor: Arc<CrashSafeExecutor>,
}

impl Processor {
    pub fn new(config: BenchConfig) -> Self {
        let primary = Arc::new(PgConnector::new("primary", config.postgresql.clone()));
        let reference = Arc::new(PgConnector::new("reference", config.reference_postgresql.clone()));
        let executor = CrashSafeExecutor::new(primary, reference, config.crash.clone());
        Self::with_executor(config, Arc::new(executor))
    }

    pub fn with_executor(config: BenchConfig, executor: Arc<CrashSafeExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn executor(&self) -> &Arc<CrashSafeExecutor> {
        &self.executor
    }

    /// Prepares once (or again with `force_prepare`), then runs every
    /// scenario in `scenario_dir` in file name order.
    pub async fn process(&self, status: &mut Status, force_prepare: bool) -> RunSummary {
        if force_prepare || !status.is_prepared() {
            let prepared = async {
                self.prepare().await?;
                status.mark_prepared()
            }
            .await;
            if let Err(e) = prepared {
                return RunSummary {
                    scenarios: Vec::new(),
                    trials: self.executor.stats(),
                    error: Some(e.context("prepare phase failed")),
                };
            }
        } else {
            tracing::info!("already prepared, skipping prepare phase");
        }

        match list_paths(&self.config.scenario_dir) {
            Ok(paths) => self.run_scenarios(&paths).await,
            Err(e) => RunSummary {
                scenarios: Vec::new(),
                trials: self.executor.stats(),
                error: Some(e),
            },
        }
    }

    /// Runs the given scenario files in order, stopping at the first failure.
    pub async fn run_scenarios(&self, paths: &[PathBuf]) -> RunSummary {
        let runner = ScenarioRunner::new(self.executor.clone());
        let mut scenarios = Vec::new();
        let mut error = None;
        for path in paths {
            let outcome = match runner.run_file(path).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            print_latency_report(&outcome.report.latencies);
            scenarios.push(outcome.report);
            if let Some(e) = outcome.error {
                error = Some(e);
                break;
            }
        }
        RunSummary {
            scenarios,
            trials: self.executor.stats(),
            error,
        }
    }

    pub async fn prepare(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        self.ensure_database().await?;
        let mut session = WorkerSession::new();
        for dir in [
            &self.config.schema_dir,
            &self.config.data_dir,
            &self.config.index_dir,
        ] {
            for path in list_paths(dir)? {
                self.process_path(&mut session, &path).await?;
            }
        }
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "prepared");
        Ok(())
    }

    async fn ensure_database(&self) -> anyhow::Result<()> {
        let database = &self.config.postgresql.database;
        let lookup = database_lookup_sql(database);
        let trial = self
            .executor
            .run(
                &mut WorkerSession::new(),
                &Statement::new(&lookup).on_database(MAINTENANCE_DATABASE),
            )
            .await?;
        let exists = trial.result.map_or(false, |r| !r.rows.is_empty());
        if !exists {
            tracing::info!(database = %database, "creating database");
            let create = create_database_sql(database);
            self.executor
                .run(
                    &mut WorkerSession::new(),
                    &Statement::new(&create).on_database(MAINTENANCE_DATABASE),
                )
                .await?;
            tracing::info!(database = %database, "created database");
        }
        if self.executor.policy().enabled {
            let reference_db = &self.config.reference_postgresql.database;
            ensure_database_on(self.executor.reference().as_ref(), reference_db).await?;
        }
        Ok(())
    }

    async fn process_path(&self, session: &mut WorkerSession, path: &Path) -> anyhow::Result<()> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        tracing::info!(path = %path.display(), "processing");
        let started = Instant::now();
        match extension {
            "sql" => {
                let sql = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                self.executor.run(session, &Statement::new(&sql)).await?;
            }
            "yaml" => {
                let source = load_data_source(path)?;
                let mut ctx = GenerationContext::new(0, 0, self.executor.policy().seed);
                for generated in source.collect(&mut ctx)? {
                    let stmt = Statement::new(&generated.sql).with_crash_test(generated.crash_test);
                    self.executor.run(session, &stmt).await?;
                }
            }
            other => {
                return Err(BenchError::config(format!(
                    "unsupported extension: .{}: {}",
                    other,
                    path.display()
                ))
                .into())
            }
        }
        tracing::info!(
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed"
        );
        Ok(())
    }
}

/// Regular files directly under `dir`, sorted by path. A missing directory
/// has no files.
pub fn list_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parses a data file: a mapping with `source:` naming the generator.
pub fn load_data_source(path: &Path) -> Result<SourceSpec, BenchError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BenchError::config(format!("failed to read {}: {}", path.display(), e)))?;
    let doc: serde_yaml::Mapping = serde_yaml::from_str(&text)
        .map_err(|e| BenchError::config(format!("failed to parse {}: {}", path.display(), e)))?;
    let kind = doc
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BenchError::config(format!("missing source: {}", path.display())))?
        .to_string();
    SourceSpec::from_payload(&kind, &doc)
        .map_err(|e| BenchError::config(format!("{}: {}", e, path.display())))
}

fn database_lookup_sql(database: &str) -> String {
    format!(
        "SELECT datname FROM pg_catalog.pg_database WHERE datname = {};",
        SqlValue::Text(database.to_string())
    )
}

fn create_database_sql(database: &str) -> String {
    format!(
        "CREATE DATABASE \"{}\"\n  WITH TEMPLATE = 'template0'\n       ENCODING = 'UTF8'\n       LC_COLLATE = 'C.UTF-8'\n       LC_CTYPE = 'C.UTF-8';",
        database.replace('"', "\"\"")
    )
}

async fn ensure_database_on(connector: &dyn Connector, database: &str) -> anyhow::Result<()> {
    let mut session = connector
        .connect(Some(MAINTENANCE_DATABASE))
        .await
        .map_err(|e| BenchError::Connection(format!("{}: {:#}", connector.label(), e)))?;
    let exists = match session.execute(&database_lookup_sql(database)).await {
        StatementOutcome::Completed(r) => !r.rows.is_empty(),
        StatementOutcome::ConnectionLost(msg) => return Err(BenchError::Connection(msg).into()),
        StatementOutcome::RejectedByDatabase(msg) => {
            return Err(BenchError::statement(connector.label(), msg).into())
        }
    };
    if exists {
        return Ok(());
    }
    tracing::info!(connection = connector.label(), database = %database, "creating database");
    match session.execute(&create_database_sql(database)).await {
        StatementOutcome::Completed(_) => Ok(()),
        StatementOutcome::ConnectionLost(msg) => Err(BenchError::Connection(msg).into()),
        StatementOutcome::RejectedByDatabase(msg) => {
            Err(BenchError::statement(connector.label(), msg).into())
        }
    }
}
