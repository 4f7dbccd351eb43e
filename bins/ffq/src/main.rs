mod report;
mod runner;

use anyhow::Context;
use ffq_config::FfqConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Usage: `ffq [config.toml]`. Without a config file the built-in defaults
/// run the test mode over anonymous memory.
fn main() -> anyhow::Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            FfqConfig::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => FfqConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let report = runner::run(&cfg)?;
    report.log();

    if let Some(path) = &cfg.result_file {
        report
            .write_json(Path::new(path))
            .with_context(|| format!("writing results to {path}"))?;
        tracing::info!(path = %path, "results written");
    }
    Ok(())
}
