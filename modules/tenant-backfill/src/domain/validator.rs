//! Post-run validation: no affected table may keep unresolved rows.

use super::registry::{TableDescriptor, TableRegistry, TargetColumn};
use super::sql;
use sea_orm::sea_query::Cond;
use sea_orm::{ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Residual state of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableValidation {
    pub table: String,
    /// Rows with any target column still NULL or empty.
    pub missing_rows: u64,
    /// Rows with `tenant_code` set but `organization_code` missing.
    pub partial_rows: u64,
    pub sample_row_ids: Vec<i64>,
}

impl TableValidation {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.missing_rows == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub tables: Vec<TableValidation>,
}

impl ValidationReport {
    /// Names of tables with residual rows.
    #[must_use]
    pub fn failed_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| !t.passed())
            .map(|t| t.table.clone())
            .collect()
    }
}

/// Count residual rows in every registry table.
///
/// # Errors
/// Returns `DbErr` when a query fails.
pub async fn validate<C: ConnectionTrait>(conn: &C, registry: &TableRegistry) -> Result<ValidationReport, DbErr> {
    let mut tables = Vec::with_capacity(registry.tables().len());
    for table in registry.tables() {
        let result = validate_table(conn, table).await?;
        if !result.passed() {
            warn!(
                table = table.name,
                missing = result.missing_rows,
                partial = result.partial_rows,
                samples = ?result.sample_row_ids,
                "Unresolved rows remain"
            );
        }
        tables.push(result);
    }
    let passed = tables.iter().all(TableValidation::passed);
    info!(passed, tables = tables.len(), "Validation finished");
    Ok(ValidationReport { passed, tables })
}

async fn validate_table<C: ConnectionTrait>(conn: &C, table: &TableDescriptor) -> Result<TableValidation, DbErr> {
    let missing = sql::any_missing(table.targets);
    let missing_rows = sql::count(conn, &sql::count_where(table.name, missing.clone())).await?;

    let partial_rows = if table.targets_column(TargetColumn::TenantCode)
        && table.targets_column(TargetColumn::OrganizationCode)
    {
        let partial = Cond::all()
            .add(sql::present(TargetColumn::TenantCode.column()))
            .add(sql::missing(TargetColumn::OrganizationCode.column()));
        sql::count(conn, &sql::count_where(table.name, partial)).await?
    } else {
        0
    };

    let sample_row_ids = if missing_rows > 0 {
        sql::row_ids(conn, &sql::sample_row_ids(table.name, table.row_id, missing)).await?
    } else {
        Vec::new()
    };

    Ok(TableValidation {
        table: table.name.to_owned(),
        missing_rows,
        partial_rows,
        sample_row_ids,
    })
}
