//! Error taxonomy of the backfill engine.

use sea_orm::DbErr;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors of a backfill run.
///
/// Non-fatal findings (missing mappings, defaulted orphans, skipped constraint
/// restorations) are not errors; they accumulate in
/// [`RunStatistics`](super::stats::RunStatistics).
#[derive(Debug, Error)]
pub enum BackfillError {
    /// Missing or invalid settings (default codes, DSN, batch size).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The mapping file lacks one of the required header columns.
    #[error("mapping file {}: missing required header(s) {}", path.display(), missing.join(", "))]
    MappingHeader { path: PathBuf, missing: Vec<String> },

    /// The mapping file cannot be opened or parsed.
    #[error("mapping file {}: {source}", path.display())]
    MappingRead {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// The mapping does not cover every organization in use.
    #[error(
        "mapping does not cover {} organization id(s) referenced by {}: {}",
        missing.len(),
        tables.join(", "),
        join_ids(missing)
    )]
    Coverage { tables: Vec<String>, missing: Vec<i64> },

    /// The table catalog is inconsistent (ordering, duplicates, targets).
    #[error("table registry: {0}")]
    Registry(String),

    /// A foreign key could not be dropped; later key changes would fail.
    #[error("failed to drop constraint {constraint} on {table}: {source}")]
    Constraint {
        table: String,
        constraint: String,
        #[source]
        source: DbErr,
    },

    /// Distribution toggling failed for a partitioned table.
    #[error("failed to {action} table {table}: {source}")]
    Distribution {
        table: String,
        action: &'static str,
        #[source]
        source: DbErr,
    },

    /// Rows whose join key is NULL and not the system sentinel.
    #[error(
        "{table}: {rows} row(s) with NULL {key_column} cannot be attributed to a tenant (sample row ids: {})",
        join_ids(sample_row_ids)
    )]
    DataIntegrity {
        table: String,
        key_column: String,
        rows: u64,
        sample_row_ids: Vec<i64>,
    },

    /// Residual unresolved rows after every phase.
    #[error("validation failed: unresolved rows remain in {}", tables.join(", "))]
    ValidationFailure { tables: Vec<String> },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl BackfillError {
    /// Stable machine-readable category used in the anomaly log.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::MappingHeader { .. } | Self::MappingRead { .. } => "mapping_file_error",
            Self::Coverage { .. } => "coverage_error",
            Self::Registry(_) => "registry_error",
            Self::Constraint { .. } => "constraint_error",
            Self::Distribution { .. } => "distribution_error",
            Self::DataIntegrity { .. } => "data_integrity_error",
            Self::ValidationFailure { .. } => "validation_failure",
            Self::Io { .. } | Self::Serialization { .. } => "io_error",
            Self::Db(_) => "database_error",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}
