//! Run report (anomaly log) written at the end of every run.

use super::error::BackfillError;
use super::snapshot::DataRestore;
use super::stats::RunStatistics;
use super::validator::ValidationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Nothing was mutated, or the run succeeded.
    NotNeeded,
    FullyRestored,
    /// Some tables or schema steps could not be restored.
    PartiallyRestored,
    /// No table could be restored.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub status: RollbackStatus,
    pub data: DataRestore,
    /// Distribution or constraint steps that did not complete.
    pub schema_failures: Vec<String>,
}

impl RollbackReport {
    #[must_use]
    pub fn not_needed() -> Self {
        Self {
            status: RollbackStatus::NotNeeded,
            data: DataRestore::default(),
            schema_failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_parts(data: DataRestore, schema_failures: Vec<String>) -> Self {
        let status = if data.failed_tables.is_empty() && schema_failures.is_empty() {
            RollbackStatus::FullyRestored
        } else if data.restored_tables.is_empty() && !data.failed_tables.is_empty() {
            RollbackStatus::Failed
        } else {
            RollbackStatus::PartiallyRestored
        };
        Self {
            status,
            data,
            schema_failures,
        }
    }

    #[must_use]
    pub fn manual_intervention_required(&self) -> bool {
        matches!(
            self.status,
            RollbackStatus::PartiallyRestored | RollbackStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub kind: String,
    pub message: String,
}

impl From<&BackfillError> for FatalError {
    fn from(err: &BackfillError) -> Self {
        Self {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<FatalError>,
    pub statistics: RunStatistics,
    pub validation: Option<ValidationReport>,
    pub rollback: RollbackReport,
}

impl RunReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Process exit status for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.succeeded())
    }

    /// # Errors
    /// Returns `BackfillError::Io` or `BackfillError::Serialization`.
    pub async fn write_to(&self, path: &Path) -> Result<(), BackfillError> {
        let body =
            serde_json::to_vec_pretty(self).map_err(|e| BackfillError::serialization(path, e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackfillError::io(parent, e))?;
        }
        tokio::fs::write(path, body)
            .await
            .map_err(|e| BackfillError::io(path, e))?;
        info!(path = %path.display(), outcome = ?self.outcome, "Run report written");
        Ok(())
    }
}
