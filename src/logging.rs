//! Logging (A3): a per-run file appender under `logdir`, installed once at
//! startup.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// File name the log is written under.
pub const LOG_FILE_NAME: &str = "database_manager.log";

/// Install a global `tracing` subscriber writing to `logdir/database_manager.log`.
/// `RUST_LOG` overrides `config.logging_level` if set, matching the rest of
/// the corpus's env-filter convention.
///
/// Returns the appender's guard; the caller must keep it alive for the
/// process's lifetime or buffered log lines are lost on drop.
pub fn init(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(&config.logdir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging_level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("installing tracing subscriber")?;

    Ok(guard)
}
