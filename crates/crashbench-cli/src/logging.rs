use anyhow::Context;
use crashbench_core::config::BenchConfig;
use std::sync::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

/// Overrides `log_level` from config.yaml, e.g. `CRASHBENCH_LOG=crashbench::sql=debug`.
pub const LOG_ENV: &str = "CRASHBENCH_LOG";

/// JSON lines into `<log_dir>/crashbench.log`; stdout stays reserved for
/// the latency report.
pub fn init_logging(config: &BenchConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create {}", config.log_dir.display()))?;
    let path = config.log_path();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| config.log_level.clone());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}
