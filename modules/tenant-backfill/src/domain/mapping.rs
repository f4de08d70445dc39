//! Organization mapping cache.
//!
//! Loads `organization_id -> (tenant_code, organization_code)` from a
//! delimited file and gates the run on coverage: every organization of the
//! source-of-truth table, and every organization id still referenced by an
//! unresolved row of an `OrgIdDirect` table, must be mapped.

use super::error::BackfillError;
use super::registry::{
    ResolutionStrategy, SOURCE_OF_TRUTH_KEY, SOURCE_OF_TRUTH_TABLE, TableDescriptor, TableRegistry,
};
use super::sql;
use sea_orm::sea_query::{Alias, Cond, Query};
use sea_orm::{ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const ORGANIZATION_ID_HEADER: &str = "organization_id";
pub const ORGANIZATION_CODE_HEADER: &str = "organization_code";
pub const TENANT_CODE_HEADER: &str = "tenant_code";

/// Resolved identity of an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantIdentity {
    pub tenant_code: String,
    pub organization_code: String,
}

impl TenantIdentity {
    #[must_use]
    pub fn new(tenant_code: impl Into<String>, organization_code: impl Into<String>) -> Self {
        Self {
            tenant_code: tenant_code.into(),
            organization_code: organization_code.into(),
        }
    }
}

/// Counters for the mapping file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingLoadStats {
    pub rows_read: u64,
    pub rows_loaded: u64,
    /// Rows with an empty required field.
    pub rows_incomplete: u64,
    /// Rows whose organization id is not an integer.
    pub rows_invalid_id: u64,
    /// Rows for organizations absent from the source-of-truth table.
    pub rows_filtered_out: u64,
    /// Later rows that replaced an earlier entry for the same id.
    pub duplicate_ids: u64,
}

/// In-memory mapping cache; read-only once built.
#[derive(Debug, Clone, Default)]
pub struct OrganizationMapping {
    entries: HashMap<i64, TenantIdentity>,
    stats: MappingLoadStats,
}

impl OrganizationMapping {
    #[must_use]
    pub fn get(&self, organization_id: i64) -> Option<&TenantIdentity> {
        self.entries.get(&organization_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> &MappingLoadStats {
        &self.stats
    }

    /// Ids of the source-of-truth set `required` with no mapping entry, ascending.
    #[must_use]
    pub fn coverage(&self, required: &BTreeSet<i64>) -> CoverageReport {
        let missing: Vec<i64> = required
            .iter()
            .copied()
            .filter(|id| !self.entries.contains_key(id))
            .collect();
        CoverageReport {
            required: required.len(),
            tables: if missing.is_empty() {
                Vec::new()
            } else {
                vec![SOURCE_OF_TRUTH_TABLE.to_owned()]
            },
            missing,
        }
    }
}

impl FromIterator<(i64, TenantIdentity)> for OrganizationMapping {
    fn from_iter<T: IntoIterator<Item = (i64, TenantIdentity)>>(iter: T) -> Self {
        let entries: HashMap<_, _> = iter.into_iter().collect();
        let loaded = entries.len() as u64;
        Self {
            entries,
            stats: MappingLoadStats {
                rows_read: loaded,
                rows_loaded: loaded,
                ..MappingLoadStats::default()
            },
        }
    }
}

/// Result of the coverage gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Number of source-of-truth organization ids.
    pub required: usize,
    /// Uncovered organization ids, ascending.
    pub missing: Vec<i64>,
    /// Tables referencing at least one uncovered id.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl CoverageReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Extend the gate with organization ids that rows of `table` reference.
    pub fn require_referenced(&mut self, mapping: &OrganizationMapping, table: &str, ids: &BTreeSet<i64>) {
        let uncovered: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| mapping.get(*id).is_none())
            .collect();
        if uncovered.is_empty() {
            return;
        }
        if !self.tables.iter().any(|t| t == table) {
            self.tables.push(table.to_owned());
        }
        let merged: BTreeSet<i64> = self.missing.iter().copied().chain(uncovered).collect();
        self.missing = merged.into_iter().collect();
    }

    /// # Errors
    /// Returns `BackfillError::Coverage` listing every uncovered id.
    pub fn ensure_complete(&self) -> Result<(), BackfillError> {
        if self.is_complete() {
            return Ok(());
        }
        Err(BackfillError::Coverage {
            tables: self.tables.clone(),
            missing: self.missing.clone(),
        })
    }
}

/// Parse a mapping file body.
///
/// Fields are trimmed; incomplete rows and non-integer ids are skipped and
/// counted. When `keep` is given, ids outside it are dropped. A later row for
/// the same id replaces the earlier one.
///
/// # Errors
/// Returns `BackfillError::MappingHeader` when a required column is absent
/// and `BackfillError::MappingRead` on malformed input.
pub fn parse_mapping<R: Read>(
    reader: R,
    delimiter: u8,
    keep: Option<&BTreeSet<i64>>,
    path: &Path,
) -> Result<OrganizationMapping, BackfillError> {
    let read_err = |source| BackfillError::MappingRead {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers().map_err(read_err)?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let required = [
        ORGANIZATION_ID_HEADER,
        ORGANIZATION_CODE_HEADER,
        TENANT_CODE_HEADER,
    ];
    let missing: Vec<String> = required
        .iter()
        .filter(|h| position(h).is_none())
        .map(|h| (*h).to_owned())
        .collect();
    let (Some(id_idx), Some(org_idx), Some(tenant_idx)) = (
        position(ORGANIZATION_ID_HEADER),
        position(ORGANIZATION_CODE_HEADER),
        position(TENANT_CODE_HEADER),
    ) else {
        return Err(BackfillError::MappingHeader {
            path: path.to_path_buf(),
            missing,
        });
    };

    let mut mapping = OrganizationMapping::default();
    for record in rdr.records() {
        let record = record.map_err(read_err)?;
        mapping.stats.rows_read += 1;

        let field = |idx: usize| record.get(idx).map(str::trim).filter(|v| !v.is_empty());
        let (Some(id), Some(org), Some(tenant)) = (field(id_idx), field(org_idx), field(tenant_idx))
        else {
            mapping.stats.rows_incomplete += 1;
            continue;
        };
        let Ok(id) = id.parse::<i64>() else {
            warn!(file = %path.display(), value = id, "Skipping mapping row with non-integer organization id");
            mapping.stats.rows_invalid_id += 1;
            continue;
        };
        if keep.is_some_and(|ids| !ids.contains(&id)) {
            mapping.stats.rows_filtered_out += 1;
            continue;
        }
        if mapping
            .entries
            .insert(id, TenantIdentity::new(tenant, org))
            .is_some()
        {
            debug!(organization_id = id, "Duplicate mapping row replaces earlier entry");
            mapping.stats.duplicate_ids += 1;
        }
    }
    mapping.stats.rows_loaded = mapping.entries.len() as u64;
    Ok(mapping)
}

/// Distinct organization ids of the source-of-truth table.
///
/// # Errors
/// Returns `DbErr` when the query fails.
pub async fn source_of_truth_ids<C: ConnectionTrait>(conn: &C) -> Result<BTreeSet<i64>, DbErr> {
    let stmt = Query::select()
        .distinct()
        .expr_as(sql::as_bigint(SOURCE_OF_TRUTH_KEY), Alias::new(sql::KEY_VALUE))
        .from(Alias::new(SOURCE_OF_TRUTH_TABLE))
        .and_where(sql::col(SOURCE_OF_TRUTH_KEY).is_not_null())
        .to_owned();
    conn.query_all(sql::build(conn, &stmt))
        .await?
        .iter()
        .map(|row| row.try_get::<i64>("", sql::KEY_VALUE))
        .collect()
}

/// Organization ids referenced by rows of `table` that still miss a target.
///
/// # Errors
/// Returns `DbErr` when the query fails.
pub async fn pending_organization_ids<C: ConnectionTrait>(
    conn: &C,
    table: &TableDescriptor,
    key: &str,
) -> Result<BTreeSet<i64>, DbErr> {
    let stmt = sql::missing_rows_by_key(
        table.name,
        key,
        table.targets,
        Cond::all().add(sql::col(key).is_not_null()),
    );
    let counts = sql::key_counts(&conn.query_all(sql::build(conn, &stmt)).await?)?;
    Ok(counts.into_iter().map(|(id, _)| id).collect())
}

/// Pending organization ids of every `OrgIdDirect` table, per table.
///
/// # Errors
/// Returns `DbErr` when a query fails.
pub async fn referenced_organization_ids<C: ConnectionTrait>(
    conn: &C,
    registry: &TableRegistry,
) -> Result<Vec<(&'static str, BTreeSet<i64>)>, DbErr> {
    let mut referenced = Vec::new();
    for table in registry.tables() {
        if table.strategy != ResolutionStrategy::OrgIdDirect {
            continue;
        }
        let Some(key) = table.join_key else {
            continue;
        };
        let ids = pending_organization_ids(conn, table, key).await?;
        if !ids.is_empty() {
            referenced.push((table.name, ids));
        }
    }
    Ok(referenced)
}

/// Builds the mapping cache for a run.
#[derive(Debug, Clone)]
pub struct LookupCacheBuilder {
    path: PathBuf,
    delimiter: u8,
    filter_to_source_of_truth: bool,
}

impl LookupCacheBuilder {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, delimiter: u8, filter_to_source_of_truth: bool) -> Self {
        Self {
            path: path.into(),
            delimiter,
            filter_to_source_of_truth,
        }
    }

    /// Load the cache and enforce coverage of every organization in use.
    ///
    /// # Errors
    /// Fails on unreadable files, missing headers, database errors, and with
    /// `BackfillError::Coverage` when a source-of-truth id, or an id still
    /// referenced by an unresolved `OrgIdDirect` row, is unmapped.
    pub async fn build<C: ConnectionTrait>(
        &self,
        conn: &C,
        registry: &TableRegistry,
    ) -> Result<OrganizationMapping, BackfillError> {
        let (mapping, mut coverage) = self.load(conn).await?;
        for (table, ids) in referenced_organization_ids(conn, registry).await? {
            coverage.require_referenced(&mapping, table, &ids);
        }
        if !coverage.is_complete() {
            warn!(
                uncovered = coverage.missing.len(),
                tables = %coverage.tables.join(", "),
                "Mapping does not cover every organization in use"
            );
        }
        coverage.ensure_complete()?;
        Ok(mapping)
    }

    /// Load the cache and report coverage without failing on gaps.
    ///
    /// # Errors
    /// Fails on unreadable files, missing headers and database errors.
    pub async fn load<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<(OrganizationMapping, CoverageReport), BackfillError> {
        let required = source_of_truth_ids(conn).await?;
        let keep = self.filter_to_source_of_truth.then_some(&required);

        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|e| BackfillError::MappingRead {
                path: self.path.clone(),
                source: csv::Error::from(e),
            })?;
        let mapping = parse_mapping(body.as_slice(), self.delimiter, keep, &self.path)?;
        let coverage = mapping.coverage(&required);

        info!(
            file = %self.path.display(),
            entries = mapping.len(),
            rows_read = mapping.stats.rows_read,
            incomplete = mapping.stats.rows_incomplete,
            invalid_id = mapping.stats.rows_invalid_id,
            filtered_out = mapping.stats.rows_filtered_out,
            source_of_truth = required.len(),
            uncovered = coverage.missing.len(),
            "Loaded organization mapping"
        );
        Ok((mapping, coverage))
    }
}
