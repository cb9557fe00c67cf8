pub mod executor;
pub mod expand;
pub mod pool;
pub mod runner;

pub use executor::{
    reconnect, CrashSafeExecutor, CrashTrial, Decision, Statement, TrialStats, WorkerSession,
};
pub use expand::expand_jobs;
pub use pool::WorkerPool;
pub use runner::{ScenarioOutcome, ScenarioReport, ScenarioRunner};
