//! Pre-mutation snapshot and data rollback.
//!
//! The snapshot records, for every row the run may touch, its row id and the
//! original target values (NULL and empty string kept apart). Rows with all
//! targets present are never modified and are not recorded. The snapshot also
//! carries the original distribution columns and discovered foreign keys so a
//! separate process can finish a rollback after a crash.

use super::constraints::ConstraintDescriptor;
use super::error::BackfillError;
use super::registry::{TableDescriptor, TableRegistry, TargetColumn};
use super::sql;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, Keyword, Order, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub row_id: i64,
    pub tenant_code: Option<String>,
    pub organization_code: Option<String>,
}

impl SnapshotRecord {
    #[must_use]
    pub fn original(&self, column: TargetColumn) -> Option<&str> {
        match column {
            TargetColumn::TenantCode => self.tenant_code.as_deref(),
            TargetColumn::OrganizationCode => self.organization_code.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table: String,
    pub row_id_column: String,
    pub targets: Vec<TargetColumn>,
    pub rows: Vec<SnapshotRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<TableSnapshot>,
    /// Original distribution column of each distributed partitioned table.
    #[serde(default)]
    pub distribution: BTreeMap<String, String>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDescriptor>,
}

impl Snapshot {
    /// Record rows of every registry table that still miss a target.
    ///
    /// # Errors
    /// Returns `DbErr` when a table cannot be read.
    pub async fn capture<C: ConnectionTrait>(conn: &C, registry: &TableRegistry) -> Result<Self, DbErr> {
        let mut tables = Vec::with_capacity(registry.tables().len());
        for table in registry.tables() {
            tables.push(capture_table(conn, table).await?);
        }
        let snapshot = Self {
            captured_at: Utc::now(),
            tables,
            distribution: BTreeMap::new(),
            constraints: Vec::new(),
        };
        info!(rows = snapshot.row_count(), tables = snapshot.tables.len(), "Snapshot captured");
        Ok(snapshot)
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    /// # Errors
    /// Returns `BackfillError::Io` or `BackfillError::Serialization`.
    pub async fn write_to(&self, path: &Path) -> Result<(), BackfillError> {
        let body = serde_json::to_vec(self).map_err(|e| BackfillError::serialization(path, e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackfillError::io(parent, e))?;
        }
        tokio::fs::write(path, body)
            .await
            .map_err(|e| BackfillError::io(path, e))?;
        info!(path = %path.display(), "Snapshot persisted");
        Ok(())
    }

    /// # Errors
    /// Returns `BackfillError::Io` or `BackfillError::Serialization`.
    pub async fn read_from(path: &Path) -> Result<Self, BackfillError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| BackfillError::io(path, e))?;
        serde_json::from_slice(&body).map_err(|e| BackfillError::serialization(path, e))
    }

    /// Remove a persisted snapshot after a successful run.
    ///
    /// # Errors
    /// Returns `BackfillError::Io` unless the file is already gone.
    pub async fn discard(path: &Path) -> Result<(), BackfillError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackfillError::io(path, e)),
        }
    }

    /// Restore every recorded original value, one transaction per table.
    ///
    /// A failing table is rolled back, reported and skipped; the remaining
    /// tables are still restored.
    pub async fn restore_rows(&self, conn: &DatabaseConnection, batch_size: u64) -> DataRestore {
        let mut result = DataRestore::default();
        for table in &self.tables {
            if table.rows.is_empty() {
                continue;
            }
            match restore_table(conn, table, batch_size).await {
                Ok(()) => {
                    info!(table = %table.table, rows = table.rows.len(), "Original values restored");
                    result.restored_tables.push(table.table.clone());
                }
                Err(e) => {
                    error!(table = %table.table, error = %e, "Failed to restore original values");
                    result.failed_tables.push(TableFailure {
                        table: table.table.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Outcome of [`Snapshot::restore_rows`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRestore {
    pub restored_tables: Vec<String>,
    pub failed_tables: Vec<TableFailure>,
}

async fn capture_table<C: ConnectionTrait>(conn: &C, table: &TableDescriptor) -> Result<TableSnapshot, DbErr> {
    let mut select = Query::select();
    select
        .expr_as(sql::as_bigint(table.row_id), Alias::new(sql::ROW_ID))
        .from(Alias::new(table.name))
        .cond_where(sql::any_missing(table.targets))
        .order_by(Alias::new(table.row_id), Order::Asc);
    for target in table.targets {
        select.column(Alias::new(target.column()));
    }

    let rows = conn.query_all(sql::build(conn, &select)).await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let value = |target: TargetColumn| -> Result<Option<String>, DbErr> {
            if table.targets_column(target) {
                row.try_get::<Option<String>>("", target.column())
            } else {
                Ok(None)
            }
        };
        records.push(SnapshotRecord {
            row_id: row.try_get::<i64>("", sql::ROW_ID)?,
            tenant_code: value(TargetColumn::TenantCode)?,
            organization_code: value(TargetColumn::OrganizationCode)?,
        });
    }
    Ok(TableSnapshot {
        table: table.name.to_owned(),
        row_id_column: table.row_id.to_owned(),
        targets: table.targets.to_vec(),
        rows: records,
    })
}

async fn restore_table(conn: &DatabaseConnection, table: &TableSnapshot, batch_size: u64) -> Result<(), DbErr> {
    let chunk_len = usize::try_from(batch_size.max(1)).unwrap_or(usize::MAX);
    let txn = conn.begin().await?;
    let outcome = async {
        for target in &table.targets {
            // Rows whose original value was present were never touched.
            let nulls: Vec<i64> = table
                .rows
                .iter()
                .filter(|r| r.original(*target).is_none())
                .map(|r| r.row_id)
                .collect();
            let blanks: Vec<i64> = table
                .rows
                .iter()
                .filter(|r| r.original(*target) == Some(""))
                .map(|r| r.row_id)
                .collect();

            for (ids, value) in [
                (nulls, SimpleExpr::Keyword(Keyword::Null)),
                (blanks, Expr::val("").into()),
            ] {
                for chunk in ids.chunks(chunk_len) {
                    let update = Query::update()
                        .table(Alias::new(table.table.as_str()))
                        .value(Alias::new(target.column()), value.clone())
                        .and_where(
                            sql::col(&table.row_id_column).is_in(chunk.iter().copied()),
                        )
                        .to_owned();
                    txn.execute(sql::build(&txn, &update)).await?;
                }
            }
        }
        Ok::<(), DbErr>(())
    }
    .await;

    match outcome {
        Ok(()) => txn.commit().await,
        Err(e) => {
            if let Err(rb) = txn.rollback().await {
                warn!(table = %table.table, error = %rb, "Transaction rollback failed");
            }
            Err(e)
        }
    }
}
