use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "crashbench",
    version,
    about = "Benchmark and crash-safety verification harness for PGroonga"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Prepare the database (once) and run every scenario
    Run(RunArgs),
    /// Run the given scenario files without preparing
    Scenario(ScenarioArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    /// directory holding config.yaml, status.yaml and the input directories
    #[arg(long, env = "CRASHBENCH_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// run the prepare phase even if status.yaml says it already ran
    #[arg(long)]
    pub force_prepare: bool,

    #[arg(long)]
    pub report_json: Option<PathBuf>,
}

#[derive(Parser, Clone)]
pub struct ScenarioArgs {
    #[arg(long, env = "CRASHBENCH_DIR", default_value = ".")]
    pub dir: PathBuf,

    #[arg(long)]
    pub report_json: Option<PathBuf>,

    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}
