use crate::errors::BenchError;
use crate::sources::SourceSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One unit of work: a statement plus the name it is reported under.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: String,
    pub index: usize,
    pub sql: String,
    pub crash_test: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub name: String,
    pub index: usize,
    pub elapsed: Duration,
}

/// A scenario file (`scenario/*.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default = "one")]
    pub n_workers: usize,
    #[serde(default = "one")]
    pub n_tries: usize,
    pub jobs: Vec<JobSpec>,
}

fn one() -> usize {
    1
}

/// One entry of `jobs:`. Either `sql` (optionally repeated `n` times) or
/// `source` with the source payload stored under a key of the same name,
/// e.g. `source: template` + `template: {...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_test: Option<bool>,
    #[serde(flatten)]
    pub payload: serde_yaml::Mapping,
}

/// Validated form of a [`JobSpec`].
#[derive(Debug, Clone)]
pub enum JobKind {
    Statement { sql: String, repeat: Option<usize> },
    Generated(SourceSpec),
}

impl JobSpec {
    pub fn kind(&self) -> Result<JobKind, BenchError> {
        match (&self.sql, &self.source) {
            (Some(_), Some(_)) => Err(BenchError::config(format!(
                "job '{}' has both sql and source",
                self.name
            ))),
            (Some(sql), None) => Ok(JobKind::Statement {
                sql: sql.clone(),
                repeat: self.n,
            }),
            (None, Some(source)) => {
                let spec = SourceSpec::from_payload(source, &self.payload)
                    .map_err(|e| BenchError::config(format!("job '{}': {}", self.name, e)))?;
                Ok(JobKind::Generated(spec))
            }
            (None, None) => Err(BenchError::config(format!(
                "job '{}' needs either sql or source",
                self.name
            ))),
        }
    }
}

impl Scenario {
    pub fn parse(text: &str, origin: &Path) -> Result<Self, BenchError> {
        let scenario: Scenario = serde_yaml::from_str(text).map_err(|e| {
            BenchError::config(format!("failed to parse scenario {}: {}", origin.display(), e))
        })?;
        scenario.validate(origin)?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self, BenchError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BenchError::config(format!("failed to read scenario {}: {}", path.display(), e))
        })?;
        Self::parse(&text, path)
    }

    /// Rejects anything that would otherwise fail after workers started.
    pub fn validate(&self, origin: &Path) -> Result<(), BenchError> {
        if self.n_workers == 0 {
            return Err(BenchError::config(format!(
                "{}: n_workers must be >= 1",
                origin.display()
            )));
        }
        if self.n_tries == 0 {
            return Err(BenchError::config(format!(
                "{}: n_tries must be >= 1",
                origin.display()
            )));
        }
        for job in &self.jobs {
            job.kind()
                .map_err(|e| BenchError::config(format!("{}: {}", origin.display(), e)))?;
        }
        Ok(())
    }
}
