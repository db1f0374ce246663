use anyhow::Result;
use clap::Parser;

use taskmon_dbm::cli::Cli;
use taskmon_dbm::config::Config;
use taskmon_dbm::lifecycle::{install_sigint_handler, Lifecycle};
use taskmon_dbm::logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    let _log_guard = logging::init(&config)?;
    tracing::info!(db_url = %config.db_url, logdir = %config.logdir.display(), "starting monitoring database manager");

    let lifecycle = Lifecycle::start(&config, None)?;
    install_sigint_handler(lifecycle.queues.priority_tx.clone());

    // The crate's own queues stand in for the transport: a real deployment
    // wires a workflow-engine client to `lifecycle.queues` here. This binary
    // just keeps the process alive until SIGINT drives it down.
    lifecycle.join()
}
