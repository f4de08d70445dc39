//! Backfill orchestrator.
//!
//! Run order:
//! 1. load the mapping cache and enforce source-of-truth coverage
//! 2. discover foreign keys, capture (and persist) the snapshot
//! 3. drop foreign keys, undistribute partitioned tables
//! 4. resolution phases in registry order
//! 5. redistribute partitioned tables on `tenant_code`
//! 6. validate, then restore foreign keys
//!
//! Failures in 1-2 leave the database untouched. Any later failure triggers
//! the compensating rollback: partitioned tables are made local again, the
//! snapshot is replayed, original distribution columns and foreign keys are
//! restored.

use super::constraints::{
    ConstraintCatalog, ConstraintDescriptor, ConstraintSuspensionManager, RestoreAction,
};
use super::error::BackfillError;
use super::executor::ResolutionExecutor;
use super::mapping::{LookupCacheBuilder, OrganizationMapping};
use super::partition::{DistributionBackend, PARTITION_KEY, PartitionController};
use super::preflight::{PreflightReport, run_preflight};
use super::registry::TableRegistry;
use super::report::{FatalError, RollbackReport, RollbackStatus, RunOutcome, RunReport};
use super::snapshot::Snapshot;
use super::stats::RunStatistics;
use super::validator::{ValidationReport, validate};
use crate::config::BackfillSettings;
use crate::infra;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Schema and data changes made so far; drives the compensating rollback.
#[derive(Debug, Clone, Default)]
pub struct MutationProgress {
    pub dropped_constraints: Vec<ConstraintDescriptor>,
    /// Partitioned tables whose distribution was changed by the run.
    pub touched_tables: BTreeSet<String>,
    pub constraints_restored: bool,
}

impl MutationProgress {
    /// Worst-case progress for a snapshot left behind by an interrupted run.
    #[must_use]
    pub fn from_snapshot(snapshot: &Snapshot, registry: &TableRegistry) -> Self {
        Self {
            dropped_constraints: snapshot.constraints.clone(),
            touched_tables: snapshot
                .distribution
                .keys()
                .cloned()
                .chain(registry.partitioned().map(|t| t.name.to_owned()))
                .collect(),
            constraints_restored: false,
        }
    }
}

/// Reverts a failed or interrupted run from its snapshot.
pub struct RollbackCoordinator {
    conn: DatabaseConnection,
    constraints: ConstraintSuspensionManager,
    partitions: PartitionController,
    batch_size: u64,
}

impl RollbackCoordinator {
    #[must_use]
    pub fn new(
        conn: DatabaseConnection,
        catalog: Arc<dyn ConstraintCatalog>,
        distribution: Arc<dyn DistributionBackend>,
        batch_size: u64,
    ) -> Self {
        Self {
            conn,
            constraints: ConstraintSuspensionManager::new(catalog),
            partitions: PartitionController::new(distribution),
            batch_size,
        }
    }

    /// Coordinator using the adapters of the connection's backend.
    ///
    /// # Errors
    /// Returns `BackfillError::Configuration` for an unsupported backend.
    pub fn for_connection(conn: DatabaseConnection, batch_size: u64) -> Result<Self, BackfillError> {
        let (catalog, distribution) = infra::adapters_for(&conn)?;
        Ok(Self::new(conn, catalog, distribution, batch_size))
    }

    /// Restore data and schema to the snapshot state; never aborts midway.
    pub async fn rollback(
        &self,
        snapshot: &Snapshot,
        progress: &MutationProgress,
        stats: &mut RunStatistics,
    ) -> RollbackReport {
        warn!(rows = snapshot.row_count(), "Rolling back to snapshot");
        let mut schema_failures = Vec::new();

        // Distributed tables reject changes to their distribution column.
        for table in &progress.touched_tables {
            if let Err(e) = self.partitions.undistribute(table).await {
                error!(table = %table, error = %e, "Rollback could not undistribute table");
                schema_failures.push(e.to_string());
            }
        }

        let data = snapshot.restore_rows(&self.conn, self.batch_size).await;

        for (table, column) in &snapshot.distribution {
            if !progress.touched_tables.contains(table) {
                continue;
            }
            if let Err(e) = self.partitions.redistribute_on(table, column).await {
                error!(table = %table, column = %column, error = %e, "Rollback could not restore distribution");
                schema_failures.push(e.to_string());
            }
        }

        if !progress.constraints_restored && !progress.dropped_constraints.is_empty() {
            let actions = self
                .constraints
                .restore(&progress.dropped_constraints, &HashSet::new(), stats)
                .await;
            for (constraint, action) in progress.dropped_constraints.iter().zip(actions) {
                if let RestoreAction::Skipped(reason) = action {
                    schema_failures.push(format!(
                        "constraint {} on {}: {reason}",
                        constraint.name, constraint.table
                    ));
                }
            }
        }

        let report = RollbackReport::from_parts(data, schema_failures);
        match report.status {
            RollbackStatus::FullyRestored => info!("Rollback completed"),
            status => error!(
                ?status,
                failed_tables = report.data.failed_tables.len(),
                schema_failures = report.schema_failures.len(),
                "Rollback incomplete; manual intervention required"
            ),
        }
        report
    }
}

pub struct BackfillEngine {
    conn: DatabaseConnection,
    registry: TableRegistry,
    settings: BackfillSettings,
    recovery: RollbackCoordinator,
}

impl BackfillEngine {
    #[must_use]
    pub fn new(
        conn: DatabaseConnection,
        registry: TableRegistry,
        settings: BackfillSettings,
        catalog: Arc<dyn ConstraintCatalog>,
        distribution: Arc<dyn DistributionBackend>,
    ) -> Self {
        let recovery = RollbackCoordinator::new(conn.clone(), catalog, distribution, settings.batch_size);
        Self {
            conn,
            registry,
            settings,
            recovery,
        }
    }

    /// Engine using the adapters of the connection's backend.
    ///
    /// # Errors
    /// Returns `BackfillError::Configuration` for an unsupported backend.
    pub fn for_connection(
        conn: DatabaseConnection,
        registry: TableRegistry,
        settings: BackfillSettings,
    ) -> Result<Self, BackfillError> {
        let (catalog, distribution) = infra::adapters_for(&conn)?;
        Ok(Self::new(conn, registry, settings, catalog, distribution))
    }

    #[must_use]
    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    fn cache_builder(&self) -> LookupCacheBuilder {
        LookupCacheBuilder::new(
            &self.settings.mapping_file,
            self.settings.delimiter,
            self.settings.filter_to_source_of_truth,
        )
    }

    /// Read-only readiness report.
    ///
    /// # Errors
    /// Fails when the mapping file cannot be read or a query fails; coverage
    /// gaps are reported, not raised.
    pub async fn check(&self) -> Result<PreflightReport, BackfillError> {
        let (mapping, coverage) = self.cache_builder().load(&self.conn).await?;
        Ok(run_preflight(&self.conn, &self.registry, &mapping, coverage).await?)
    }

    /// Execute a complete run and write the report.
    ///
    /// Never returns an error: the outcome, the fatal error if any, and the
    /// rollback result are all part of the report.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let mut stats = RunStatistics::default();
        let mut validation = None;
        info!(
            tables = self.registry.tables().len(),
            batch_size = self.settings.batch_size,
            "Starting tenant backfill"
        );

        let (error, rollback) = match self.prepare(&mut stats).await {
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Backfill aborted before any change");
                (Some(e), RollbackReport::not_needed())
            }
            Ok((mapping, snapshot)) => {
                let mut progress = MutationProgress::default();
                match self
                    .mutate(&mapping, &snapshot, &mut progress, &mut validation, &mut stats)
                    .await
                {
                    Ok(()) => {
                        self.discard_snapshot().await;
                        (None, RollbackReport::not_needed())
                    }
                    Err(e) => {
                        error!(error = %e, kind = e.kind(), "Backfill failed; rolling back");
                        let rollback = self.recovery.rollback(&snapshot, &progress, &mut stats).await;
                        if rollback.status == RollbackStatus::FullyRestored {
                            self.discard_snapshot().await;
                        }
                        (Some(e), rollback)
                    }
                }
            }
        };

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            outcome: if error.is_none() {
                RunOutcome::Succeeded
            } else {
                RunOutcome::Failed
            },
            error: error.as_ref().map(FatalError::from),
            statistics: stats,
            validation,
            rollback,
        };
        if let Err(e) = report.write_to(&self.settings.report_path).await {
            error!(error = %e, "Failed to write run report");
        }
        info!(
            outcome = ?report.outcome,
            rows_updated = report.statistics.total_rows_updated(),
            missing_mappings = report.statistics.anomalies.missing_mappings.len(),
            "Tenant backfill finished"
        );
        report
    }

    async fn prepare(
        &self,
        stats: &mut RunStatistics,
    ) -> Result<(OrganizationMapping, Snapshot), BackfillError> {
        let mapping = self.cache_builder().build(&self.conn, &self.registry).await?;
        stats.mapping = mapping.stats().clone();

        let names = self.registry.names();
        let constraints = self.recovery.constraints.discover(&names).await?;

        let mut snapshot = Snapshot::capture(&self.conn, &self.registry).await?;
        snapshot.constraints = constraints;
        for table in self.registry.partitioned() {
            let column = self
                .recovery
                .partitions
                .distribution_column(table.name)
                .await?;
            if let Some(column) = column {
                snapshot.distribution.insert(table.name.to_owned(), column);
            }
        }
        if let Some(path) = &self.settings.snapshot_path {
            snapshot.write_to(path).await?;
        }
        Ok((mapping, snapshot))
    }

    async fn mutate(
        &self,
        mapping: &OrganizationMapping,
        snapshot: &Snapshot,
        progress: &mut MutationProgress,
        validation: &mut Option<ValidationReport>,
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        let constraints = &self.recovery.constraints;
        let partitions = &self.recovery.partitions;

        constraints
            .suspend(&snapshot.constraints, &mut progress.dropped_constraints, stats)
            .await?;

        for table in self.registry.partitioned() {
            progress.touched_tables.insert(table.name.to_owned());
            if partitions.undistribute(table.name).await? {
                stats.tables_undistributed.push(table.name.to_owned());
            }
        }

        let executor = ResolutionExecutor::new(
            self.conn.clone(),
            self.settings.defaults.clone(),
            self.settings.batch_size,
        );
        executor.run_phases(&self.registry, mapping, stats).await?;

        for table in self.registry.partitioned() {
            if partitions.redistribute(table.name).await? {
                stats.tables_redistributed.push(table.name.to_owned());
            }
        }

        let report = validate(&self.conn, &self.registry).await?;
        let failed = report.failed_tables();
        *validation = Some(report);
        if !failed.is_empty() {
            return Err(BackfillError::ValidationFailure { tables: failed });
        }

        let mut partitioned = HashSet::new();
        for table in self.registry.partitioned() {
            if partitions.distribution_column(table.name).await?.as_deref() == Some(PARTITION_KEY) {
                partitioned.insert(table.name.to_owned());
            }
        }
        constraints
            .restore(&progress.dropped_constraints, &partitioned, stats)
            .await;
        progress.constraints_restored = true;
        Ok(())
    }

    async fn discard_snapshot(&self) {
        if let Some(path) = &self.settings.snapshot_path
            && let Err(e) = Snapshot::discard(path).await
        {
            warn!(error = %e, "Failed to remove snapshot file");
        }
    }
}
