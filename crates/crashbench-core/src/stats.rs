use crate::model::ExecutionRecord;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

/// Latency summary of one job name, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStat {
    pub count: usize,
    pub median: f64,
    pub mean: f64,
    pub p90: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencyStat {
    /// Returns `None` for an empty sample.
    pub fn from_durations(durations: &[Duration]) -> Option<Self> {
        let mut vs: Vec<f64> = durations.iter().map(Duration::as_secs_f64).collect();
        if vs.is_empty() {
            return None;
        }
        vs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = vs.len();
        let mean = vs.iter().sum::<f64>() / n as f64;
        Some(Self {
            count: n,
            median: vs[n / 2],
            mean,
            p90: percentile(&vs, 0.90),
            p95: percentile(&vs, 0.95),
            min: vs[0],
            max: vs[n - 1],
        })
    }
}

/// Element at `ceil(q * n)`, clamped to the last one.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let idx = (sorted.len() as f64 * q).ceil() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Collects execution records from all workers of a scenario.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: ExecutionRecord) {
        self.records.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    /// One entry per job name, in the order names were first recorded.
    pub fn summarize(&self) -> Vec<(String, LatencyStat)> {
        let records = self.records.lock();
        let mut groups: Vec<(String, Vec<Duration>)> = Vec::new();
        for r in records.iter() {
            match groups.iter_mut().find(|(name, _)| *name == r.name) {
                Some((_, ds)) => ds.push(r.elapsed),
                None => groups.push((r.name.clone(), vec![r.elapsed])),
            }
        }
        groups
            .into_iter()
            .filter_map(|(name, ds)| LatencyStat::from_durations(&ds).map(|s| (name, s)))
            .collect()
    }
}
