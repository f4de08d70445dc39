//! Resolution executor.
//!
//! Runs the registry phases in order. Each table gets a primary pass (mapping
//! or upstream lookup per join key), a defaults pass for system-sentinel and
//! global rows, and a final data-integrity check for NULL join keys that no
//! rule covers. Updates are chunked; every chunk commits in its own
//! transaction, so an aborted run leaves whole chunks behind for the rollback
//! to revert.

use super::error::BackfillError;
use super::mapping::{OrganizationMapping, TenantIdentity};
use super::registry::{ResolutionStrategy, TableDescriptor, TableRegistry, TargetColumn, Upstream};
use super::sql;
use super::stats::{
    DataIntegrityRows, DefaultReason, MissingMapping, MissingReason, OrphanedReference, RunStatistics,
};
use sea_orm::sea_query::{Alias, Cond, Query};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, TransactionTrait};
use std::collections::HashMap;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct ResolutionExecutor {
    conn: DatabaseConnection,
    defaults: TenantIdentity,
    batch_size: u64,
}

impl ResolutionExecutor {
    #[must_use]
    pub fn new(conn: DatabaseConnection, defaults: TenantIdentity, batch_size: u64) -> Self {
        Self {
            conn,
            defaults,
            batch_size: batch_size.max(1),
        }
    }

    /// Execute every phase of the registry.
    ///
    /// # Errors
    /// Aborts on the first database failure or `BackfillError::DataIntegrity`.
    pub async fn run_phases(
        &self,
        registry: &TableRegistry,
        mapping: &OrganizationMapping,
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        for phase in registry.phases() {
            let span = info_span!("phase", strategy = %phase.strategy);
            async {
                for table in &phase.tables {
                    self.resolve_table(registry, table, mapping, stats).await?;
                }
                Ok::<(), BackfillError>(())
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }

    /// Resolve one table; returns the number of rows filled.
    ///
    /// # Errors
    /// Returns database failures and `BackfillError::DataIntegrity` when NULL
    /// join keys remain on a table that does not default them.
    pub async fn resolve_table(
        &self,
        registry: &TableRegistry,
        table: &TableDescriptor,
        mapping: &OrganizationMapping,
        stats: &mut RunStatistics,
    ) -> Result<u64, BackfillError> {
        let before = stats.rows_updated_by_table.get(table.name).copied().unwrap_or_default();

        match (table.strategy, table.join_key) {
            (ResolutionStrategy::DefaultsOnly, _) | (_, None) => {
                let rows = self.fill(table, &self.defaults, Cond::all()).await?;
                stats.record_defaulted(table.strategy, table.name, rows, DefaultReason::DefaultsOnly);
            }
            (ResolutionStrategy::OrgIdDirect, Some(key)) => {
                self.resolve_direct(table, key, mapping, stats).await?;
                self.apply_defaults(table, key, stats).await?;
                self.check_null_keys(table, key, stats).await?;
            }
            (strategy, Some(key)) => {
                let upstream = strategy.upstream().ok_or_else(|| {
                    BackfillError::Registry(format!("{strategy} has no upstream table"))
                })?;
                let upstream_targets = registry
                    .get(upstream.table)
                    .map_or(table.targets, |d| d.targets);
                self.resolve_joined(table, key, upstream, upstream_targets, stats)
                    .await?;
                self.apply_defaults(table, key, stats).await?;
                self.check_null_keys(table, key, stats).await?;
            }
        }

        let after = stats.rows_updated_by_table.get(table.name).copied().unwrap_or_default();
        let rows = after - before;
        info!(table = table.name, strategy = %table.strategy, rows, "Table resolved");
        Ok(rows)
    }

    async fn unresolved_keys(&self, table: &TableDescriptor, key: &str) -> Result<Vec<(i64, u64)>, DbErr> {
        let mut extra = Cond::all().add(sql::col(key).is_not_null());
        if let Some(sentinel) = table.system_sentinel {
            extra = extra.add(sql::col(key).ne(sentinel));
        }
        let stmt = sql::missing_rows_by_key(table.name, key, table.targets, extra);
        let rows = self.conn.query_all(sql::build(&self.conn, &stmt)).await?;
        sql::key_counts(&rows)
    }

    async fn resolve_direct(
        &self,
        table: &TableDescriptor,
        key: &str,
        mapping: &OrganizationMapping,
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        for (org_id, pending) in self.unresolved_keys(table, key).await? {
            match mapping.get(org_id) {
                Some(identity) => {
                    let rows = self.fill(table, identity, key_filter(key, org_id)).await?;
                    stats.record_updated(table.strategy, table.name, rows);
                }
                None => {
                    warn!(table = table.name, organization_id = org_id, rows = pending, "No mapping for organization");
                    stats.anomalies.missing_mappings.push(MissingMapping {
                        table: table.name.to_owned(),
                        key_column: key.to_owned(),
                        key_value: org_id,
                        rows: pending,
                        reason: MissingReason::Unmapped,
                    });
                }
            }
        }
        Ok(())
    }

    async fn resolve_joined(
        &self,
        table: &TableDescriptor,
        key: &str,
        upstream: Upstream,
        upstream_targets: &[TargetColumn],
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        let pending = self.unresolved_keys(table, key).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let keys: Vec<i64> = pending.iter().map(|(k, _)| *k).collect();
        let identities = self.upstream_identities(upstream, upstream_targets, &keys).await?;

        for (value, rows_pending) in pending {
            let resolved = match identities.get(&value) {
                Some(Some(identity)) => Some(identity),
                Some(None) => {
                    stats.anomalies.missing_mappings.push(MissingMapping {
                        table: table.name.to_owned(),
                        key_column: key.to_owned(),
                        key_value: value,
                        rows: rows_pending,
                        reason: MissingReason::UpstreamUnresolved,
                    });
                    None
                }
                None if table.default_orphans => {
                    debug!(table = table.name, key, value, rows = rows_pending, "Defaulting orphaned reference");
                    stats.anomalies.orphaned_references.push(OrphanedReference {
                        table: table.name.to_owned(),
                        key_column: key.to_owned(),
                        key_value: value,
                        rows: rows_pending,
                    });
                    Some(&self.defaults)
                }
                None => {
                    stats.anomalies.missing_mappings.push(MissingMapping {
                        table: table.name.to_owned(),
                        key_column: key.to_owned(),
                        key_value: value,
                        rows: rows_pending,
                        reason: MissingReason::UpstreamMissing,
                    });
                    None
                }
            };
            if let Some(identity) = resolved {
                let rows = self.fill(table, identity, key_filter(key, value)).await?;
                stats.record_updated(table.strategy, table.name, rows);
            } else {
                warn!(table = table.name, key, value, rows = rows_pending, "Upstream identity unavailable");
            }
        }
        Ok(())
    }

    /// Upstream identities keyed by upstream key.
    ///
    /// `None` marks an upstream row that exists but is itself unresolved.
    async fn upstream_identities(
        &self,
        upstream: Upstream,
        upstream_targets: &[TargetColumn],
        keys: &[i64],
    ) -> Result<HashMap<i64, Option<TenantIdentity>>, DbErr> {
        let has_org = upstream_targets.contains(&TargetColumn::OrganizationCode);
        let mut out = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(usize::try_from(self.batch_size).unwrap_or(usize::MAX)) {
            let mut select = Query::select();
            select
                .expr_as(sql::as_bigint(upstream.key_column), Alias::new(sql::KEY_VALUE))
                .column(Alias::new(TargetColumn::TenantCode.column()))
                .from(Alias::new(upstream.table))
                .and_where(sql::col(upstream.key_column).is_in(chunk.iter().copied()));
            if has_org {
                select.column(Alias::new(TargetColumn::OrganizationCode.column()));
            }
            for row in self.conn.query_all(sql::build(&self.conn, &select)).await? {
                let key = row.try_get::<i64>("", sql::KEY_VALUE)?;
                let tenant = non_blank(row.try_get::<Option<String>>("", TargetColumn::TenantCode.column())?);
                let org = if has_org {
                    non_blank(row.try_get::<Option<String>>("", TargetColumn::OrganizationCode.column())?)
                } else {
                    Some(String::new())
                };
                let identity = tenant
                    .zip(org)
                    .map(|(tenant_code, organization_code)| TenantIdentity {
                        tenant_code,
                        organization_code,
                    });
                out.insert(key, identity);
            }
        }
        Ok(out)
    }

    /// Defaults for sentinel rows and, where allowed, NULL-key rows.
    async fn apply_defaults(
        &self,
        table: &TableDescriptor,
        key: &str,
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        if let Some(sentinel) = table.system_sentinel {
            let rows = self
                .fill(table, &self.defaults, key_filter(key, sentinel))
                .await?;
            stats.record_defaulted(table.strategy, table.name, rows, DefaultReason::SystemSentinel);
        }
        if table.default_null_keys {
            let rows = self
                .fill(table, &self.defaults, Cond::all().add(sql::col(key).is_null()))
                .await?;
            stats.record_defaulted(table.strategy, table.name, rows, DefaultReason::NullKey);
        }
        Ok(())
    }

    async fn check_null_keys(
        &self,
        table: &TableDescriptor,
        key: &str,
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        let filter = Cond::all()
            .add(sql::col(key).is_null())
            .add(sql::any_missing(table.targets));
        let rows = sql::count(&self.conn, &sql::count_where(table.name, filter.clone())).await?;
        if rows == 0 {
            return Ok(());
        }
        let sample_row_ids =
            sql::row_ids(&self.conn, &sql::sample_row_ids(table.name, table.row_id, filter)).await?;
        stats.anomalies.data_integrity.push(DataIntegrityRows {
            table: table.name.to_owned(),
            key_column: key.to_owned(),
            rows,
            sample_row_ids: sample_row_ids.clone(),
        });
        Err(BackfillError::DataIntegrity {
            table: table.name.to_owned(),
            key_column: key.to_owned(),
            rows,
            sample_row_ids,
        })
    }

    /// Fill missing targets of rows matching `filter`, chunk by chunk.
    async fn fill(
        &self,
        table: &TableDescriptor,
        identity: &TenantIdentity,
        filter: Cond,
    ) -> Result<u64, DbErr> {
        let assignments: Vec<(TargetColumn, &str)> = table
            .targets
            .iter()
            .map(|t| match t {
                TargetColumn::TenantCode => (*t, identity.tenant_code.as_str()),
                TargetColumn::OrganizationCode => (*t, identity.organization_code.as_str()),
            })
            .collect();
        let update = sql::fill_chunk(
            table.name,
            table.row_id,
            &assignments,
            filter,
            self.batch_size,
        );
        let stmt = sql::build(&self.conn, &update);

        let mut total = 0;
        loop {
            let txn = self.conn.begin().await?;
            let affected = match txn.execute(stmt.clone()).await {
                Ok(res) => res.rows_affected(),
                Err(e) => {
                    if let Err(rb) = txn.rollback().await {
                        warn!(table = table.name, error = %rb, "Transaction rollback failed");
                    }
                    return Err(e);
                }
            };
            txn.commit().await?;
            total += affected;
            if affected < self.batch_size {
                break;
            }
        }
        Ok(total)
    }
}

fn key_filter(key: &str, value: i64) -> Cond {
    Cond::all().add(sql::col(key).eq(value))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
