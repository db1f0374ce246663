//! CLI (A2): flags mirroring `Config`'s fields, each optional so the
//! config-loading precedence (CLI > file > default) can tell "not given"
//! apart from "given, matches the default".

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "taskmon-dbm", about = "Monitoring database manager")]
pub struct Cli {
    /// Path to a TOML config file, consulted before built-in defaults.
    #[arg(long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Store connection string (default: a local file-backed SQLite at monitoring.db).
    #[arg(long, value_name = "URL")]
    pub db_url: Option<String>,

    /// Directory for log output, created if absent.
    #[arg(long, value_name = "DIR")]
    pub logdir: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Seconds the batcher accumulates before flushing.
    #[arg(long, value_name = "SECS")]
    pub batch_interval: Option<f64>,

    /// Maximum batch size.
    #[arg(long, value_name = "N")]
    pub batch_threshold: Option<usize>,
}
