//! In-process stand-in for a PostgreSQL cluster.
//!
//! The "SQL" understood here is deliberately tiny:
//! `INSERT <word>` appends a word, `DUMP` returns the content joined by
//! commas, `FAIL ...` is rejected, `SELECT 1` answers one row, and the
//! `pg_database` lookup / `CREATE DATABASE` pair used by the prepare phase
//! manage a set of database names. Everything else succeeds with no rows.
#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use crashbench_core::config::CrashPolicy;
use crashbench_core::db::{Connector, QueryResult, Row, Session, StatementOutcome};
use crashbench_core::engine::CrashSafeExecutor;
use crashbench_core::errors::BenchError;
use crashbench_core::killer::{BackendKiller, KillerHandle};
use crashbench_core::oracle::{DatabaseDump, IndexDiffResult, Oracle};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct ClusterState {
    content: Vec<String>,
    databases: BTreeSet<String>,
    next_pid: i32,
    dead: HashSet<i32>,
    /// Sessions to kill right after their next statement completes.
    doomed: HashSet<i32>,
    executed: Vec<String>,
    connect_attempts: usize,
    unreachable: bool,
    wipe_on_crash: bool,
    crashes: usize,
    /// Delays handed to the killer, in spawn order.
    kill_delays: Vec<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.state.lock().databases.insert("postgres".into());
        cluster.state.lock().next_pid = 1000;
        cluster
    }

    /// A crash loses everything stored so far.
    pub fn wipe_on_crash(self) -> Self {
        self.state.lock().wipe_on_crash = true;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn content(&self) -> Vec<String> {
        self.state.lock().content.clone()
    }

    pub fn databases(&self) -> Vec<String> {
        self.state.lock().databases.iter().cloned().collect()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn crashes(&self) -> usize {
        self.state.lock().crashes
    }

    pub fn kill_delays(&self) -> Vec<Duration> {
        self.state.lock().kill_delays.clone()
    }

    /// SIGKILL of one backend: the postmaster restarts and every other
    /// session goes down with it.
    pub fn kill(&self, pid: i32) {
        let mut s = self.state.lock();
        if s.dead.contains(&pid) {
            return;
        }
        for p in 1000..s.next_pid {
            s.dead.insert(p);
        }
        s.crashes += 1;
        if s.wipe_on_crash {
            s.content.clear();
        }
    }

    pub fn kill_after_next_statement(&self, pid: i32) {
        self.state.lock().doomed.insert(pid);
    }

    pub fn connector(&self, label: &str) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            label: label.to_string(),
            cluster: self.clone(),
        })
    }

    fn execute(&self, pid: i32, sql: &str) -> StatementOutcome {
        let outcome = {
            let mut s = self.state.lock();
            if s.dead.contains(&pid) {
                return StatementOutcome::ConnectionLost("server closed the connection unexpectedly".into());
            }
            s.executed.push(sql.to_string());
            let sql = sql.trim();
            if let Some(word) = sql.strip_prefix("INSERT ") {
                s.content.push(word.to_string());
                StatementOutcome::Completed(affected(1))
            } else if sql.starts_with("UPDATE ") {
                StatementOutcome::Completed(affected(0))
            } else if sql == "DUMP" {
                let dump = s.content.join(",");
                StatementOutcome::Completed(single("dump", &dump))
            } else if sql.starts_with("FAIL") {
                StatementOutcome::RejectedByDatabase("ERROR: syntax error".into())
            } else if sql == "SELECT 1" {
                StatementOutcome::Completed(single("?column?", "1"))
            } else if sql.starts_with("SELECT datname FROM pg_catalog.pg_database") {
                let name = sql.split('\'').nth(1).unwrap_or_default().to_string();
                if s.databases.contains(&name) {
                    StatementOutcome::Completed(single("datname", &name))
                } else {
                    StatementOutcome::Completed(QueryResult::default())
                }
            } else if let Some(rest) = sql.strip_prefix("CREATE DATABASE \"") {
                let name = rest.split('"').next().unwrap_or_default().to_string();
                s.databases.insert(name);
                StatementOutcome::Completed(QueryResult::default())
            } else {
                StatementOutcome::Completed(QueryResult::default())
            }
        };
        let doomed = self.state.lock().doomed.remove(&pid);
        if doomed {
            self.kill(pid);
        }
        outcome
    }
}

fn affected(n: u64) -> QueryResult {
    QueryResult {
        rows: Vec::new(),
        rows_affected: Some(n),
    }
}

fn single(column: &str, value: &str) -> QueryResult {
    let columns: Arc<[String]> = Arc::from(vec![column.to_string()]);
    QueryResult {
        rows: vec![Row::new(columns, vec![Some(value.to_string())])],
        rows_affected: Some(1),
    }
}

pub struct FakeConnector {
    label: String,
    cluster: FakeCluster,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, database: Option<&str>) -> anyhow::Result<Box<dyn Session>> {
        let mut s = self.cluster.state.lock();
        s.connect_attempts += 1;
        if s.unreachable {
            bail!("connection refused");
        }
        if let Some(db) = database {
            if !s.databases.contains(db) {
                bail!("database \"{}\" does not exist", db);
            }
        }
        let pid = s.next_pid;
        s.next_pid += 1;
        Ok(Box::new(FakeSession {
            cluster: self.cluster.clone(),
            pid,
        }))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

pub struct FakeSession {
    cluster: FakeCluster,
    pid: i32,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, sql: &str) -> StatementOutcome {
        self.cluster.execute(self.pid, sql)
    }

    async fn backend_pid(&mut self) -> anyhow::Result<i32> {
        if self.is_closed() {
            bail!("connection closed");
        }
        Ok(self.pid)
    }

    fn is_closed(&self) -> bool {
        self.cluster.state.lock().dead.contains(&self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTiming {
    /// Backend dies before the statement reaches it.
    BeforeStatement,
    /// Backend dies right after the statement completed.
    AfterStatement,
}

pub struct FakeKiller {
    cluster: FakeCluster,
    timing: KillTiming,
}

impl FakeKiller {
    pub fn new(cluster: &FakeCluster, timing: KillTiming) -> Arc<dyn BackendKiller> {
        Arc::new(Self {
            cluster: cluster.clone(),
            timing,
        })
    }
}

#[async_trait]
impl BackendKiller for FakeKiller {
    async fn spawn(&self, backend_pid: i32, delay: Duration) -> anyhow::Result<KillerHandle> {
        self.cluster.state.lock().kill_delays.push(delay);
        match self.timing {
            KillTiming::BeforeStatement => self.cluster.kill(backend_pid),
            KillTiming::AfterStatement => self.cluster.kill_after_next_statement(backend_pid),
        }
        Ok(KillerHandle::new(tokio::spawn(async { Ok(()) })))
    }
}

/// Dumps via `DUMP`; index diffs are whatever the test configured.
#[derive(Default)]
pub struct FakeOracle {
    diffs: Mutex<Vec<IndexDiffResult>>,
}

impl FakeOracle {
    pub fn with_diffs(diffs: Vec<IndexDiffResult>) -> Arc<Self> {
        Arc::new(Self {
            diffs: Mutex::new(diffs),
        })
    }
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn dump(&self, session: &mut dyn Session) -> Result<DatabaseDump, BenchError> {
        match session.execute("DUMP").await {
            StatementOutcome::Completed(r) => Ok(DatabaseDump::new(r.first_value().unwrap_or_default())),
            StatementOutcome::ConnectionLost(m) => Err(BenchError::Connection(m)),
            StatementOutcome::RejectedByDatabase(m) => Err(BenchError::statement("fake", m)),
        }
    }

    async fn diff_indexes(&self, _session: &mut dyn Session) -> Result<Vec<IndexDiffResult>, BenchError> {
        Ok(self.diffs.lock().clone())
    }
}

pub fn crash_policy(ratio: f64) -> CrashPolicy {
    CrashPolicy {
        enabled: true,
        crash_ratio: ratio,
        crash_delay: Duration::from_millis(5),
        reconnect_interval: Duration::from_millis(1),
        reconnect_deadline: Duration::from_secs(2),
        seed: Some(7),
    }
}

pub struct Harness {
    pub primary: FakeCluster,
    pub reference: FakeCluster,
    pub executor: Arc<CrashSafeExecutor>,
}

impl Harness {
    pub fn new(primary: FakeCluster, policy: CrashPolicy, timing: KillTiming) -> Self {
        Self::with_oracle(primary, policy, timing, FakeOracle::with_diffs(Vec::new()))
    }

    pub fn with_oracle(
        primary: FakeCluster,
        policy: CrashPolicy,
        timing: KillTiming,
        oracle: Arc<FakeOracle>,
    ) -> Self {
        let reference = FakeCluster::new();
        let executor = CrashSafeExecutor::new(
            primary.connector("primary"),
            reference.connector("reference"),
            policy,
        )
        .with_oracle(oracle)
        .with_killer(FakeKiller::new(&primary, timing));
        Self {
            primary,
            reference,
            executor: Arc::new(executor),
        }
    }
}
