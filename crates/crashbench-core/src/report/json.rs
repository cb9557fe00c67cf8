use crate::engine::{ScenarioReport, TrialStats};
use crate::stats::LatencyStat;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Machine-readable summary of a whole run, written next to the console
/// report when `--report-json` is given.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trials: TrialStats,
    pub scenarios: Vec<ScenarioEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioEntry {
    pub path: PathBuf,
    pub n_workers: usize,
    pub executed: usize,
    pub jobs: Vec<JobLatency>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobLatency {
    pub name: String,
    #[serde(flatten)]
    pub latency: LatencyStat,
}

impl RunReport {
    pub fn new(
        scenarios: &[ScenarioReport],
        trials: TrialStats,
        error: Option<&anyhow::Error>,
    ) -> Self {
        Self {
            generated_at: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            passed: error.is_none(),
            error: error.map(|e| format!("{e:#}")),
            trials,
            scenarios: scenarios.iter().map(ScenarioEntry::from).collect(),
        }
    }
}

impl From<&ScenarioReport> for ScenarioEntry {
    fn from(r: &ScenarioReport) -> Self {
        Self {
            path: r.path.clone(),
            n_workers: r.n_workers,
            executed: r.executed,
            jobs: r
                .latencies
                .iter()
                .map(|(name, latency)| JobLatency {
                    name: name.clone(),
                    latency: *latency,
                })
                .collect(),
        }
    }
}

pub fn write_json_report(report: &RunReport, out: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(out, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_json_report_shape() {
        let stat = LatencyStat::from_durations(&[Duration::from_millis(20)]).unwrap();
        let scenario = ScenarioReport {
            path: PathBuf::from("scenario/search.yaml"),
            n_workers: 2,
            executed: 1,
            latencies: vec![("search".to_string(), stat)],
        };
        let trials = TrialStats {
            mirror: 1,
            ..TrialStats::default()
        };
        let err = anyhow::anyhow!("boom");
        let report = RunReport::new(&[scenario], trials, Some(&err));

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out/report.json");
        write_json_report(&report, &out).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(v["passed"], false);
        assert_eq!(v["error"], "boom");
        assert_eq!(v["trials"]["mirror"], 1);
        assert_eq!(v["scenarios"][0]["jobs"][0]["name"], "search");
        assert_eq!(v["scenarios"][0]["jobs"][0]["count"], 1);
        assert!(v["generated_at"].is_string());
    }
}
