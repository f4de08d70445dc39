//! Layered application configuration.
//!
//! Precedence: built-in defaults, then the YAML file, then `TABE__*`
//! environment variables, then command line overrides.

use anyhow::{Context, Result};
use backfill_db::DbConnConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tenant_backfill::BackfillConfig;

pub const ENV_PREFIX: &str = "TABE__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_level() -> String {
    "info".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_level")]
    pub level: String,
    pub format: LogFormat,
    /// Also write logs to this file (non-blocking, no ANSI).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database: DbConnConfig,
    pub backfill: BackfillConfig,
    pub logging: LoggingConfig,
}

/// Values taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub mapping_file: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub verbose: u8,
}

impl AppConfig {
    /// # Errors
    /// Fails when the file cannot be parsed or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file_exact(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("invalid configuration")
    }

    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(path) = &overrides.mapping_file {
            self.backfill.mapping_file = Some(path.clone());
        }
        if let Some(path) = &overrides.report_path {
            self.backfill.report_path.clone_from(path);
        }
        match overrides.verbose {
            0 => {}
            1 => "info".clone_into(&mut self.logging.level),
            2 => "debug".clone_into(&mut self.logging.level),
            _ => "trace".clone_into(&mut self.logging.level),
        }
    }

    /// # Errors
    /// Fails when the configuration cannot be serialized.
    pub fn to_yaml(&self) -> Result<String> {
        let mut printable = self.clone();
        printable.database.dsn = printable
            .database
            .dsn
            .as_deref()
            .map(|dsn| backfill_db::redact_credentials_in_dsn(Some(dsn)));
        serde_saphyr::to_string(&printable).context("failed to render configuration")
    }
}
