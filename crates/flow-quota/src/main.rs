mod bootstrap;
mod report;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use quota_core::settings::Settings;
use quota_runtime::engine::AccrualEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();

    bootstrap::setup_logging(settings.effective_log_level(), settings.log_file.as_ref())?;

    tracing::info!("flow-quota v{} starting", env!("CARGO_PKG_VERSION"));

    let config = settings.engine_config()?;
    tracing::info!(
        root = %config.root.display(),
        ledger = %config.ledger_path.display(),
        max_depth = config.max_depth,
        workers = config.workers,
        "configuration resolved"
    );

    let run = AccrualEngine::new(config).run(Local::now()).await?;

    if !settings.quiet {
        print!("{}", report::render_usage_table(&run.ledger));
    }
    tracing::info!("{}", report::summary_line(&run.report));
    tracing::info!("flow-quota finished");

    Ok(())
}
