use super::executor::{CrashSafeExecutor, Statement, WorkerSession};
use super::expand::expand_jobs;
use super::pool::WorkerPool;
use crate::errors::BenchError;
use crate::model::Scenario;
use crate::stats::{LatencyStat, StatisticsAggregator};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Latency summary of one scenario file.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub path: PathBuf,
    pub n_workers: usize,
    pub executed: usize,
    pub latencies: Vec<(String, LatencyStat)>,
}

/// A finished scenario. `error` is set when the run was aborted; the report
/// still holds everything measured before that.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub report: ScenarioReport,
    pub error: Option<anyhow::Error>,
}

impl ScenarioOutcome {
    pub fn into_result(self) -> anyhow::Result<ScenarioReport> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.report),
        }
    }
}

pub struct ScenarioRunner {
    executor: Arc<CrashSafeExecutor>,
}

impl ScenarioRunner {
    pub fn new(executor: Arc<CrashSafeExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run_file(&self, path: &Path) -> anyhow::Result<ScenarioOutcome> {
        let scenario = Scenario::load(path)?;
        Ok(self.run(&scenario, path).await)
    }

    pub async fn run(&self, scenario: &Scenario, path: &Path) -> ScenarioOutcome {
        tracing::info!(scenario = %path.display(), n_workers = scenario.n_workers, n_tries = scenario.n_tries, "running scenario");
        let stats = Arc::new(StatisticsAggregator::new());

        let mut error = self
            .run_setup(scenario)
            .await
            .with_context(|| format!("setup of {} failed", path.display()))
            .err();

        let mut executed = 0;
        if error.is_none() {
            match self.run_jobs(scenario, stats.clone()).await {
                Ok(n) => executed = n,
                Err(e) => error = Some(e.context(format!("scenario {} aborted", path.display()))),
            }
        }

        let report = ScenarioReport {
            path: path.to_path_buf(),
            n_workers: scenario.n_workers,
            executed: if error.is_some() { stats.len() } else { executed },
            latencies: stats.summarize(),
        };
        ScenarioOutcome { report, error }
    }

    async fn run_setup(&self, scenario: &Scenario) -> Result<(), BenchError> {
        if scenario.setup.is_empty() {
            return Ok(());
        }
        let mut session = WorkerSession::new();
        for sql in &scenario.setup {
            let stmt = Statement::new(sql).with_crash_test(Some(false));
            self.executor.run(&mut session, &stmt).await?;
        }
        Ok(())
    }

    async fn run_jobs(
        &self,
        scenario: &Scenario,
        stats: Arc<StatisticsAggregator>,
    ) -> anyhow::Result<usize> {
        let mut pool = WorkerPool::start(self.executor.clone(), stats, scenario.n_workers);
        let seed = self.executor.policy().seed;
        let expansion = expand_jobs(scenario, seed, |job| {
            if pool.submit(job) {
                Ok(())
            } else {
                Err(BenchError::Connection("worker pool aborted".into()))
            }
        });
        // A worker error takes precedence over the expansion stopping because of it.
        let executed = pool.finish().await?;
        expansion?;
        Ok(executed)
    }
}
