//! Crash-safe statement execution.
//!
//! Each statement takes one of three paths:
//!
//! * `Direct`: crash testing is off, the statement opted out, or it targets
//!   another database (bootstrap against `postgres`). Primary only.
//! * `Mirror`: run on primary and reference, no fault injection.
//! * `CrashTest`: a killer process SIGKILLs the primary backend after a
//!   random delay while the statement runs. If the connection drops, the
//!   primary is reconnected, the statement replayed, and the primary's
//!   before/after content must match one of the reference's before/after
//!   states. Index columns are diffed against their lexicons as well.

use crate::config::CrashPolicy;
use crate::db::{Connector, QueryResult, Session, StatementOutcome};
use crate::errors::BenchError;
use crate::killer::{BackendKiller, ProcessKiller};
use crate::oracle::{verify_dumps, verify_index_diffs, DatabaseDump, Oracle, PgroongaOracle};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cheap query proving a freshly opened session is usable.
pub const LIVENESS_PROBE: &str = "SELECT 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Direct,
    Mirror,
    CrashTest,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Statement<'a> {
    pub sql: &'a str,
    /// `Some(false)` opts the statement out of crash testing.
    pub crash_test: Option<bool>,
    /// Explicit database; always executed directly.
    pub database: Option<&'a str>,
}

impl<'a> Statement<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            crash_test: None,
            database: None,
        }
    }

    pub fn with_crash_test(mut self, crash_test: Option<bool>) -> Self {
        self.crash_test = crash_test;
        self
    }

    pub fn on_database(mut self, database: &'a str) -> Self {
        self.database = Some(database);
        self
    }
}

/// What one statement execution went through.
#[derive(Debug, Clone)]
pub struct CrashTrial {
    pub decision: Decision,
    pub crashed: bool,
    /// Primary content before and after the replay (crashed trials only).
    pub primary_dumps: Vec<DatabaseDump>,
    /// Reference content before and after the statement (crashed trials only).
    pub reference_dumps: Vec<DatabaseDump>,
    /// Primary result; `None` when the primary lost the connection.
    pub result: Option<QueryResult>,
}

impl CrashTrial {
    fn plain(decision: Decision, result: QueryResult) -> Self {
        Self {
            decision,
            crashed: false,
            primary_dumps: Vec::new(),
            reference_dumps: Vec::new(),
            result: Some(result),
        }
    }
}

#[derive(Debug, Default)]
pub struct TrialCounters {
    direct: AtomicU64,
    mirror: AtomicU64,
    crash_test: AtomicU64,
    crashed: AtomicU64,
    zero_row_updates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrialStats {
    pub direct: u64,
    pub mirror: u64,
    pub crash_test: u64,
    pub crashed: u64,
    /// UPDATE/DELETE statements that matched no rows.
    pub zero_row_updates: u64,
}

impl TrialCounters {
    pub fn snapshot(&self) -> TrialStats {
        TrialStats {
            direct: self.direct.load(Ordering::Relaxed),
            mirror: self.mirror.load(Ordering::Relaxed),
            crash_test: self.crash_test.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            zero_row_updates: self.zero_row_updates.load(Ordering::Relaxed),
        }
    }

    fn bump(&self, decision: Decision) {
        let c = match decision {
            Decision::Direct => &self.direct,
            Decision::Mirror => &self.mirror,
            Decision::CrashTest => &self.crash_test,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connections owned by one worker. Both are opened lazily and replaced
/// when found closed.
#[derive(Default)]
pub struct WorkerSession {
    primary: Option<Box<dyn Session>>,
    reference: Option<Box<dyn Session>>,
}

impl WorkerSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }
}

pub struct CrashSafeExecutor {
    primary: Arc<dyn Connector>,
    reference: Arc<dyn Connector>,
    oracle: Arc<dyn Oracle>,
    killer: Arc<dyn BackendKiller>,
    policy: CrashPolicy,
    rng: Mutex<StdRng>,
    counters: TrialCounters,
}

impl CrashSafeExecutor {
    pub fn new(primary: Arc<dyn Connector>, reference: Arc<dyn Connector>, policy: CrashPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            primary,
            reference,
            oracle: Arc::new(PgroongaOracle::new()),
            killer: Arc::new(ProcessKiller::new()),
            policy,
            rng: Mutex::new(rng),
            counters: TrialCounters::default(),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_killer(mut self, killer: Arc<dyn BackendKiller>) -> Self {
        self.killer = killer;
        self
    }

    pub fn policy(&self) -> &CrashPolicy {
        &self.policy
    }

    pub fn reference(&self) -> &Arc<dyn Connector> {
        &self.reference
    }

    pub fn stats(&self) -> TrialStats {
        self.counters.snapshot()
    }

    /// Path selection for a given draw `r` in `[0, 1)`. A ratio of 0 never
    /// crash-tests and a ratio of 1 (or more) always does.
    pub fn decide_with(policy: &CrashPolicy, stmt: &Statement<'_>, r: f64) -> Decision {
        if !policy.enabled || stmt.crash_test == Some(false) || stmt.database.is_some() {
            return Decision::Direct;
        }
        if r < policy.crash_ratio {
            Decision::CrashTest
        } else {
            Decision::Mirror
        }
    }

    pub fn decide(&self, stmt: &Statement<'_>) -> Decision {
        let r: f64 = self.rng.lock().gen();
        Self::decide_with(&self.policy, stmt, r)
    }

    fn draw_delay(&self) -> Duration {
        let max = self.policy.crash_delay.as_secs_f64();
        if max <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.rng.lock().gen_range(0.0..max))
    }

    pub async fn run(
        &self,
        session: &mut WorkerSession,
        stmt: &Statement<'_>,
    ) -> Result<CrashTrial, BenchError> {
        let decision = self.decide(stmt);
        self.counters.bump(decision);
        match decision {
            Decision::Direct => self.run_direct(session, stmt).await,
            Decision::Mirror => self.run_mirror(session, stmt).await,
            Decision::CrashTest => self.run_crash_test(session, stmt).await,
        }
    }

    async fn run_direct(
        &self,
        session: &mut WorkerSession,
        stmt: &Statement<'_>,
    ) -> Result<CrashTrial, BenchError> {
        let result = match stmt.database {
            Some(database) => {
                let mut s = self.primary.connect(Some(database)).await.map_err(|e| {
                    BenchError::Connection(format!("{}/{}: {:#}", self.primary.label(), database, e))
                })?;
                let outcome = execute_logged(s.as_mut(), self.primary.label(), stmt.sql).await;
                expect_completed(outcome, self.primary.label())?
            }
            None => {
                let s = self.primary_session(session).await?;
                let outcome = execute_logged(s.as_mut(), self.primary.label(), stmt.sql).await;
                expect_completed(outcome, self.primary.label())?
            }
        };
        self.note_result(stmt.sql, &result);
        Ok(CrashTrial::plain(Decision::Direct, result))
    }

    async fn run_mirror(
        &self,
        session: &mut WorkerSession,
        stmt: &Statement<'_>,
    ) -> Result<CrashTrial, BenchError> {
        let primary = self.primary_session(session).await?;
        let outcome = execute_logged(primary.as_mut(), self.primary.label(), stmt.sql).await;
        let result = expect_completed(outcome, self.primary.label())?;
        self.note_result(stmt.sql, &result);

        let reference = self.reference_session(session).await?;
        let outcome = execute_logged(reference.as_mut(), self.reference.label(), stmt.sql).await;
        expect_completed(outcome, self.reference.label())?;

        Ok(CrashTrial::plain(Decision::Mirror, result))
    }

    async fn run_crash_test(
        &self,
        session: &mut WorkerSession,
        stmt: &Statement<'_>,
    ) -> Result<CrashTrial, BenchError> {
        let primary = self.primary_session(session).await?;
        let backend_pid = primary
            .backend_pid()
            .await
            .map_err(|e| BenchError::Connection(format!("{}: {:#}", self.primary.label(), e)))?;
        let delay = self.draw_delay();
        let killer = self
            .killer
            .spawn(backend_pid, delay)
            .await
            .map_err(|e| BenchError::Connection(format!("failed to spawn killer: {e:#}")))?;

        let outcome = execute_logged(primary.as_mut(), self.primary.label(), stmt.sql).await;
        let (crashed, result) = match outcome {
            StatementOutcome::Completed(r) => (false, Some(r)),
            StatementOutcome::ConnectionLost(msg) => {
                tracing::debug!(backend_pid, error = %msg, "primary crashed during statement");
                (true, None)
            }
            StatementOutcome::RejectedByDatabase(msg) => {
                if let Err(e) = killer.wait().await {
                    tracing::warn!(backend_pid, error = %e, "killer did not exit cleanly");
                }
                session.primary = None;
                return Err(BenchError::statement(self.primary.label(), msg));
            }
        };
        if let Err(e) = killer.wait().await {
            tracing::warn!(backend_pid, error = %e, "killer did not exit cleanly");
        }
        if let Some(r) = &result {
            self.note_result(stmt.sql, r);
        }

        let mut reference_dumps = Vec::new();
        let reference = self.reference_session(session).await?;
        if crashed {
            reference_dumps.push(self.oracle.dump(reference.as_mut()).await?);
        }
        let outcome = execute_logged(reference.as_mut(), self.reference.label(), stmt.sql).await;
        expect_completed(outcome, self.reference.label())?;
        if crashed {
            reference_dumps.push(self.oracle.dump(reference.as_mut()).await?);
        }

        if !crashed {
            // The kill may still have hit the now idle backend.
            session.primary = None;
            return Ok(CrashTrial {
                decision: Decision::CrashTest,
                crashed: false,
                primary_dumps: Vec::new(),
                reference_dumps,
                result,
            });
        }
        self.counters.crashed.fetch_add(1, Ordering::Relaxed);

        let mut primary = reconnect(
            self.primary.as_ref(),
            self.policy.reconnect_interval,
            self.policy.reconnect_deadline,
        )
        .await?;
        let mut primary_dumps = Vec::with_capacity(2);
        primary_dumps.push(self.oracle.dump(primary.as_mut()).await?);
        let outcome = execute_logged(primary.as_mut(), self.primary.label(), stmt.sql).await;
        let replayed = expect_completed(outcome, self.primary.label())?;
        primary_dumps.push(self.oracle.dump(primary.as_mut()).await?);

        if let Err(e) = verify_dumps(&primary_dumps, &reference_dumps) {
            tracing::error!(
                backend_pid,
                diagnostics = %e.diagnostics(),
                "primary content does not match any admissible post-crash state"
            );
            return Err(e.into());
        }
        let diffs = self.oracle.diff_indexes(primary.as_mut()).await?;
        verify_index_diffs(&diffs)?;
        tracing::info!(backend_pid, delay_ms = delay.as_millis() as u64, "crash trial verified");

        session.primary = Some(primary);
        Ok(CrashTrial {
            decision: Decision::CrashTest,
            crashed: true,
            primary_dumps,
            reference_dumps,
            result: Some(replayed),
        })
    }

    async fn primary_session<'s>(
        &self,
        session: &'s mut WorkerSession,
    ) -> Result<&'s mut Box<dyn Session>, BenchError> {
        if session.primary.as_ref().map_or(true, |s| s.is_closed()) {
            session.primary = Some(
                reconnect(
                    self.primary.as_ref(),
                    self.policy.reconnect_interval,
                    self.policy.reconnect_deadline,
                )
                .await?,
            );
        }
        session
            .primary
            .as_mut()
            .ok_or_else(|| BenchError::Connection("primary session unavailable".into()))
    }

    async fn reference_session<'s>(
        &self,
        session: &'s mut WorkerSession,
    ) -> Result<&'s mut Box<dyn Session>, BenchError> {
        if session.reference.as_ref().map_or(true, |s| s.is_closed()) {
            let s = self.reference.connect(None).await.map_err(|e| {
                BenchError::Connection(format!("{}: {:#}", self.reference.label(), e))
            })?;
            session.reference = Some(s);
        }
        session
            .reference
            .as_mut()
            .ok_or_else(|| BenchError::Connection("reference session unavailable".into()))
    }

    fn note_result(&self, sql: &str, result: &QueryResult) {
        if result.rows_affected == Some(0) && is_row_update(sql) {
            self.counters.zero_row_updates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sql = %first_line(sql), "statement matched no rows");
        }
    }
}

/// Reopens a session, probing it every `interval` until it answers or
/// `deadline` has passed. A zero deadline fails without any attempt.
pub async fn reconnect(
    connector: &dyn Connector,
    interval: Duration,
    deadline: Duration,
) -> Result<Box<dyn Session>, BenchError> {
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_error = String::from("no attempt made");
    loop {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return Err(BenchError::Connection(format!(
                "{} unreachable after {:?} ({} attempts): {}",
                connector.label(),
                deadline,
                attempts,
                last_error
            )));
        }
        attempts += 1;
        let remaining = deadline - elapsed;
        match tokio::time::timeout(remaining, connector.connect(None)).await {
            Ok(Ok(mut s)) => match s.execute(LIVENESS_PROBE).await {
                StatementOutcome::Completed(_) => {
                    if attempts > 1 {
                        tracing::info!(
                            connection = connector.label(),
                            attempts,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "reconnected"
                        );
                    }
                    return Ok(s);
                }
                StatementOutcome::ConnectionLost(msg) | StatementOutcome::RejectedByDatabase(msg) => {
                    last_error = msg;
                }
            },
            Ok(Err(e)) => last_error = format!("{e:#}"),
            Err(_) => last_error = "connect timed out".to_string(),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn execute_logged(session: &mut dyn Session, target: &str, sql: &str) -> StatementOutcome {
    for line in sql.lines() {
        tracing::debug!(target: "crashbench::sql", connection = target, "SQL: {}", line);
    }
    session.execute(sql).await
}

fn expect_completed(outcome: StatementOutcome, target: &str) -> Result<QueryResult, BenchError> {
    match outcome {
        StatementOutcome::Completed(r) => Ok(r),
        StatementOutcome::ConnectionLost(msg) => Err(BenchError::Connection(format!(
            "{target}: connection lost: {msg}"
        ))),
        StatementOutcome::RejectedByDatabase(msg) => Err(BenchError::statement(target, msg)),
    }
}

fn is_row_update(sql: &str) -> bool {
    let head = sql.trim_start();
    let keyword: String = head.chars().take(6).collect::<String>().to_ascii_uppercase();
    keyword == "UPDATE" || keyword == "DELETE"
}

fn first_line(sql: &str) -> &str {
    sql.trim_start().lines().next().unwrap_or_default()
}
