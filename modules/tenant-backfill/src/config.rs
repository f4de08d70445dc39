//! `backfill:` configuration section.

use crate::domain::error::BackfillError;
use crate::domain::mapping::TenantIdentity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_delimiter() -> String {
    ",".to_owned()
}

fn default_batch_size() -> u64 {
    1000
}

fn default_filter_to_source_of_truth() -> bool {
    true
}

fn default_report_path() -> PathBuf {
    PathBuf::from("backfill-report.json")
}

fn default_snapshot_path() -> Option<PathBuf> {
    Some(PathBuf::from("backfill-snapshot.json"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackfillConfig {
    /// Tenant code for system, global and orphaned rows.
    pub default_tenant_code: Option<String>,
    pub default_organization_code: Option<String>,
    /// Delimited file with `organization_id`, `organization_code`, `tenant_code`.
    pub mapping_file: Option<PathBuf>,
    /// Single-byte field delimiter of the mapping file.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Maximum rows per update statement and transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Drop mapping rows whose organization is absent from the database.
    #[serde(default = "default_filter_to_source_of_truth")]
    pub filter_to_source_of_truth: bool,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    /// Persisted copy of the pre-mutation snapshot; `null` keeps it in memory only.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            default_tenant_code: None,
            default_organization_code: None,
            mapping_file: None,
            delimiter: default_delimiter(),
            batch_size: default_batch_size(),
            filter_to_source_of_truth: default_filter_to_source_of_truth(),
            report_path: default_report_path(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Validated settings of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSettings {
    pub defaults: TenantIdentity,
    pub mapping_file: PathBuf,
    pub delimiter: u8,
    pub batch_size: u64,
    pub filter_to_source_of_truth: bool,
    pub report_path: PathBuf,
    pub snapshot_path: Option<PathBuf>,
}

impl BackfillConfig {
    /// Validate into run settings.
    ///
    /// # Errors
    /// Returns `BackfillError::Configuration` when a default code or the
    /// mapping file is missing, the batch size is zero, or the delimiter is
    /// not a single ASCII character.
    pub fn settings(&self) -> Result<BackfillSettings, BackfillError> {
        let required = |value: &Option<String>, key: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| BackfillError::Configuration(format!("backfill.{key} is required")))
        };
        let tenant_code = required(&self.default_tenant_code, "default_tenant_code")?;
        let organization_code =
            required(&self.default_organization_code, "default_organization_code")?;
        let mapping_file = self
            .mapping_file
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| BackfillError::Configuration("backfill.mapping_file is required".to_owned()))?;

        Ok(BackfillSettings {
            defaults: TenantIdentity {
                tenant_code,
                organization_code,
            },
            mapping_file,
            delimiter: self.delimiter_byte()?,
            batch_size: self.checked_batch_size()?,
            filter_to_source_of_truth: self.filter_to_source_of_truth,
            report_path: self.report_path.clone(),
            snapshot_path: self.snapshot_path.clone(),
        })
    }

    /// # Errors
    /// Returns `BackfillError::Configuration` for a zero batch size.
    pub fn checked_batch_size(&self) -> Result<u64, BackfillError> {
        if self.batch_size == 0 {
            return Err(BackfillError::Configuration(
                "backfill.batch_size must be greater than zero".to_owned(),
            ));
        }
        Ok(self.batch_size)
    }

    fn delimiter_byte(&self) -> Result<u8, BackfillError> {
        match self.delimiter.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(BackfillError::Configuration(format!(
                "backfill.delimiter must be a single ASCII character, got '{}'",
                self.delimiter
            ))),
        }
    }
}
