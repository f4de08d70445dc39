//! Connection configuration, environment expansion and DSN redaction.

use crate::{ConnectOpts, DbError, DbHandle, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `database:` section of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbConnConfig {
    /// Connection string; `${VAR}` placeholders are expanded from the environment.
    pub dsn: Option<String>,
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

impl DbConnConfig {
    /// DSN with environment placeholders expanded.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig` if no DSN is configured, `DbError::EnvVar`
    /// if a placeholder cannot be resolved, or `DbError::UnknownDsn` for an
    /// unsupported scheme.
    pub fn resolved_dsn(&self) -> Result<String> {
        let raw = self
            .dsn
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DbError::InvalidConfig("database.dsn is required".to_owned()))?;
        let dsn = expand_env_vars(raw)?;
        DbHandle::detect(&dsn)?;
        Ok(dsn)
    }

    #[must_use]
    pub fn connect_opts(&self) -> ConnectOpts {
        let defaults = ConnectOpts::default();
        ConnectOpts {
            max_conns: self.max_conns.or(defaults.max_conns),
            min_conns: self.min_conns.or(defaults.min_conns),
            acquire_timeout: self.acquire_timeout.or(defaults.acquire_timeout),
            idle_timeout: self.idle_timeout.or(defaults.idle_timeout),
            test_before_acquire: defaults.test_before_acquire,
        }
    }
}

/// Expand `${VAR}` placeholders from the process environment.
///
/// # Errors
/// Returns `DbError::EnvVar` naming the first variable that is not set.
pub fn expand_env_vars(input: &str) -> Result<String> {
    let placeholder = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| DbError::InvalidConfig(e.to_string()))?;

    let mut expanded = String::with_capacity(input.len());
    let mut tail = 0;
    for caps in placeholder.captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = std::env::var(name.as_str()).map_err(|source| DbError::EnvVar {
            name: name.as_str().to_owned(),
            source,
        })?;
        expanded.push_str(&input[tail..whole.start()]);
        expanded.push_str(&value);
        tail = whole.end();
    }
    expanded.push_str(&input[tail..]);
    Ok(expanded)
}

/// DSN safe for logs and `print-config`: the password becomes `***`.
///
/// A DSN with credentials that does not parse as a URL is hidden entirely.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    let Some(dsn) = dsn else {
        return "none".to_owned();
    };
    if !dsn.contains('@') {
        return dsn.to_owned();
    }
    match url::Url::parse(dsn) {
        Ok(mut parsed) if parsed.password().is_some() => match parsed.set_password(Some("***")) {
            Ok(()) => parsed.to_string(),
            Err(()) => "***".to_owned(),
        },
        Ok(parsed) => parsed.to_string(),
        Err(_) => "***".to_owned(),
    }
}
