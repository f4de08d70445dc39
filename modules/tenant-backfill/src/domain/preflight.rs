//! Read-only pre-flight checks.
//!
//! Reports, without mutating anything, whether a run would succeed: mapping
//! coverage, unmapped organization ids, NULL join keys the registry does not
//! default, and join keys without an upstream row. Only rows still missing a
//! target are considered.

use super::mapping::{CoverageReport, OrganizationMapping, pending_organization_ids};
use super::registry::{ResolutionStrategy, TableDescriptor, TableRegistry};
use super::sql;
use sea_orm::sea_query::{Alias, Cond, Query};
use sea_orm::{ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Findings for one table with a join key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIntegrity {
    pub table: String,
    pub key_column: String,
    pub null_keys: u64,
    /// NULL keys on a table that does not default them.
    pub null_keys_blocking: bool,
    /// Keys with no upstream row, ascending and capped.
    pub orphaned_keys: Vec<i64>,
    pub orphaned_rows: u64,
    /// Orphans on a table that does not default them.
    pub orphans_blocking: bool,
    /// Organization ids in use that the mapping does not cover.
    pub unmapped_organizations: Vec<i64>,
}

impl TableIntegrity {
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.null_keys_blocking || self.orphans_blocking || !self.unmapped_organizations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub mapping_entries: usize,
    pub coverage: CoverageReport,
    pub tables: Vec<TableIntegrity>,
    /// No blocking finding anywhere.
    pub clean: bool,
}

/// Inspect every registry table.
///
/// # Errors
/// Returns `DbErr` when a query fails.
pub async fn run_preflight<C: ConnectionTrait>(
    conn: &C,
    registry: &TableRegistry,
    mapping: &OrganizationMapping,
    coverage: CoverageReport,
) -> Result<PreflightReport, DbErr> {
    let mut tables = Vec::new();
    for table in registry.tables() {
        let Some(key) = table.join_key else {
            continue;
        };
        tables.push(inspect_table(conn, table, key, mapping).await?);
    }
    let clean = coverage.is_complete() && !tables.iter().any(TableIntegrity::is_blocking);
    info!(
        clean,
        uncovered = coverage.missing.len(),
        blocking_tables = tables.iter().filter(|t| t.is_blocking()).count(),
        "Pre-flight finished"
    );
    Ok(PreflightReport {
        mapping_entries: mapping.len(),
        coverage,
        tables,
        clean,
    })
}

async fn inspect_table<C: ConnectionTrait>(
    conn: &C,
    table: &TableDescriptor,
    key: &str,
    mapping: &OrganizationMapping,
) -> Result<TableIntegrity, DbErr> {
    let pending_null = Cond::all()
        .add(sql::col(key).is_null())
        .add(sql::any_missing(table.targets));
    let null_keys = sql::count(conn, &sql::count_where(table.name, pending_null)).await?;

    let mut report = TableIntegrity {
        table: table.name.to_owned(),
        key_column: key.to_owned(),
        null_keys,
        null_keys_blocking: null_keys > 0 && !table.default_null_keys,
        ..TableIntegrity::default()
    };

    if let Some(upstream) = table.strategy.upstream() {
        let known = Query::select()
            .column(Alias::new(upstream.key_column))
            .from(Alias::new(upstream.table))
            .and_where(sql::col(upstream.key_column).is_not_null())
            .to_owned();
        let mut filter = Cond::all()
            .add(sql::col(key).is_not_null())
            .add(sql::col(key).not_in_subquery(known));
        if let Some(sentinel) = table.system_sentinel {
            filter = filter.add(sql::col(key).ne(sentinel));
        }
        let stmt = sql::missing_rows_by_key(table.name, key, table.targets, filter);
        let counts = sql::key_counts(&conn.query_all(sql::build(conn, &stmt)).await?)?;
        report.orphaned_rows = counts.iter().map(|(_, n)| n).sum();
        report.orphaned_keys = counts
            .iter()
            .map(|(k, _)| *k)
            .take(usize::try_from(sql::SAMPLE_LIMIT).unwrap_or(usize::MAX))
            .collect();
        report.orphans_blocking = report.orphaned_rows > 0 && !table.default_orphans;
    }

    if table.strategy == ResolutionStrategy::OrgIdDirect {
        report.unmapped_organizations = pending_organization_ids(conn, table, key)
            .await?
            .into_iter()
            .filter(|k| mapping.get(*k).is_none())
            .collect();
    }
    Ok(report)
}
