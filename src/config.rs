//! Configuration (A1): CLI flags override a TOML file, which overrides
//! built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Cli;

/// Resolved configuration the lifecycle is started with.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub logdir: PathBuf,
    pub logging_level: String,
    pub batching_interval: Duration,
    pub batching_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "monitoring.db".to_string(),
            logdir: PathBuf::from("."),
            logging_level: "info".to_string(),
            batching_interval: Duration::from_secs(1),
            batching_threshold: 99_999,
        }
    }
}

/// Mirrors `Config`, but every field optional — the shape of both the TOML
/// file and the CLI flags before they're merged over the defaults.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    db_url: Option<String>,
    logdir: Option<PathBuf>,
    logging_level: Option<String>,
    batching_interval_secs: Option<f64>,
    batching_threshold: Option<usize>,
}

impl PartialConfig {
    fn merge_over(self, base: Config) -> Config {
        Config {
            db_url: self.db_url.unwrap_or(base.db_url),
            logdir: self.logdir.unwrap_or(base.logdir),
            logging_level: self.logging_level.unwrap_or(base.logging_level),
            batching_interval: self
                .batching_interval_secs
                .map(Duration::from_secs_f64)
                .unwrap_or(base.batching_interval),
            batching_threshold: self.batching_threshold.unwrap_or(base.batching_threshold),
        }
    }
}

impl Config {
    /// Load defaults, overlay a TOML file if one was given and exists,
    /// then overlay CLI flags (CLI > file > default).
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = Config::default();

        let config_path = cli.config_file.clone().or_else(default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let file_config: PartialConfig = toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                config = file_config.merge_over(config);
            } else if cli.config_file.is_some() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
        }

        let cli_config = PartialConfig {
            db_url: cli.db_url.clone(),
            logdir: cli.logdir.clone(),
            logging_level: cli.log_level.clone(),
            batching_interval_secs: cli.batch_interval,
            batching_threshold: cli.batch_threshold,
        };
        config = cli_config.merge_over(config);

        Ok(config)
    }
}

/// Default config file location, consulted when `--config-file` isn't
/// given: `<user config dir>/taskmon-dbm/config.toml`.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("taskmon-dbm").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_fill_in_over_defaults() {
        let base = Config::default();
        let partial = PartialConfig {
            db_url: Some("custom.db".to_string()),
            ..Default::default()
        };
        let merged = partial.merge_over(base);
        assert_eq!(merged.db_url, "custom.db");
        assert_eq!(merged.batching_threshold, 99_999);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let base = Config {
            db_url: "from-file.db".to_string(),
            ..Config::default()
        };
        let cli_override = PartialConfig {
            db_url: Some("from-cli.db".to_string()),
            ..Default::default()
        };
        let merged = cli_override.merge_over(base);
        assert_eq!(merged.db_url, "from-cli.db");
    }
}
