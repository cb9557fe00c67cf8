use super::args::*;
use crate::logging::init_logging;
use crashbench_core::config::load_config;
use crashbench_core::errors::{find_bench_error, BenchError};
use crashbench_core::processor::{Processor, RunSummary};
use crashbench_core::report::{write_json_report, RunReport};
use crashbench_core::status::Status;
use std::path::Path;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const VERIFY_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const FATAL: i32 = 3;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => cmd_run(args).await,
        Command::Scenario(args) => cmd_scenario(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.dir)?;
    init_logging(&config)?;
    tracing::info!(dir = %config.dir.display(), crash_test = config.crash.enabled, "starting run");

    let mut status = Status::load(&config.dir)?;
    let processor = Processor::new(config);
    let summary = processor.process(&mut status, args.force_prepare).await;
    finish(summary, args.report_json.as_deref())
}

async fn cmd_scenario(args: ScenarioArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.dir)?;
    init_logging(&config)?;
    tracing::info!(dir = %config.dir.display(), files = args.files.len(), "running scenarios");

    let processor = Processor::new(config);
    let summary = processor.run_scenarios(&args.files).await;
    finish(summary, args.report_json.as_deref())
}

fn finish(summary: RunSummary, report_json: Option<&Path>) -> anyhow::Result<i32> {
    if let Some(out) = report_json {
        let report = RunReport::new(&summary.scenarios, summary.trials, summary.error.as_ref());
        write_json_report(&report, out)?;
    }
    let trials = summary.trials;
    tracing::info!(
        direct = trials.direct,
        mirror = trials.mirror,
        crash_test = trials.crash_test,
        crashed = trials.crashed,
        zero_row_updates = trials.zero_row_updates,
        "run finished"
    );
    match summary.error {
        None => Ok(exit_codes::OK),
        Some(e) => {
            if let Some(BenchError::Verify(v)) = find_bench_error(&e) {
                tracing::error!(diagnostics = %v.diagnostics(), "verification failed");
            }
            tracing::error!(error = %format!("{e:#}"), "run failed");
            eprintln!("error: {e:#}");
            Ok(exit_code_for(&e))
        }
    }
}

pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match find_bench_error(err) {
        Some(BenchError::Verify(_)) => exit_codes::VERIFY_FAILED,
        Some(BenchError::Configuration(_)) => exit_codes::CONFIG_ERROR,
        _ => exit_codes::FATAL,
    }
}
