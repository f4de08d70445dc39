//! Distribution (horizontal partitioning) control.
//!
//! Every operation is a no-op when the distribution extension is not
//! installed, and every toggle re-reads the current state first, so the
//! controller can be driven repeatedly by a run and by its rollback.

use super::error::BackfillError;
use super::registry::TENANT_CODE;
use async_trait::async_trait;
use sea_orm::DbErr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Partition key of every partitioned table after a successful run.
pub const PARTITION_KEY: &str = TENANT_CODE;

/// Database-specific distribution primitives.
#[async_trait]
pub trait DistributionBackend: Send + Sync {
    async fn extension_active(&self) -> Result<bool, DbErr>;

    /// Current distribution column, `None` when the table is local.
    async fn distribution_column(&self, table: &str) -> Result<Option<String>, DbErr>;

    async fn undistribute_table(&self, table: &str) -> Result<(), DbErr>;

    async fn create_distributed_table(&self, table: &str, column: &str) -> Result<(), DbErr>;
}

pub struct PartitionController {
    backend: Arc<dyn DistributionBackend>,
    active: OnceCell<bool>,
}

impl PartitionController {
    #[must_use]
    pub fn new(backend: Arc<dyn DistributionBackend>) -> Self {
        Self {
            backend,
            active: OnceCell::new(),
        }
    }

    /// Whether the extension is installed; queried once per controller.
    ///
    /// # Errors
    /// Returns `DbErr` when the lookup fails.
    pub async fn is_active(&self) -> Result<bool, DbErr> {
        self.active
            .get_or_try_init(|| self.backend.extension_active())
            .await
            .copied()
    }

    /// # Errors
    /// Returns `DbErr` when the catalog cannot be read.
    pub async fn distribution_column(&self, table: &str) -> Result<Option<String>, DbErr> {
        if !self.is_active().await? {
            return Ok(None);
        }
        self.backend.distribution_column(table).await
    }

    /// `true` when toggling `table` can proceed; logs the skip otherwise.
    async fn toggle_allowed(&self, table: &str) -> Result<bool, BackfillError> {
        let active = self
            .is_active()
            .await
            .map_err(|source| distribution_error(table, "inspect", source))?;
        if !active {
            debug!(table, "Distribution extension inactive; skipping");
        }
        Ok(active)
    }

    /// Make `table` local; `true` when it was distributed.
    ///
    /// # Errors
    /// Returns `BackfillError::Distribution` when the conversion fails.
    pub async fn undistribute(&self, table: &str) -> Result<bool, BackfillError> {
        if !self.toggle_allowed(table).await? {
            return Ok(false);
        }
        let current = self
            .distribution_column(table)
            .await
            .map_err(|source| distribution_error(table, "inspect", source))?;
        let Some(column) = current else {
            debug!(table, "Table is not distributed");
            return Ok(false);
        };
        self.backend
            .undistribute_table(table)
            .await
            .map_err(|source| distribution_error(table, "undistribute", source))?;
        info!(table, column = %column, "Table undistributed");
        Ok(true)
    }

    /// Distribute `table` on [`PARTITION_KEY`].
    ///
    /// # Errors
    /// See [`Self::redistribute_on`].
    pub async fn redistribute(&self, table: &str) -> Result<bool, BackfillError> {
        self.redistribute_on(table, PARTITION_KEY).await
    }

    /// Distribute `table` on `column`; `true` when anything changed.
    ///
    /// A table already distributed on another column is undistributed first.
    ///
    /// # Errors
    /// Returns `BackfillError::Distribution` when a conversion fails.
    pub async fn redistribute_on(&self, table: &str, column: &str) -> Result<bool, BackfillError> {
        if !self.toggle_allowed(table).await? {
            return Ok(false);
        }
        match self
            .distribution_column(table)
            .await
            .map_err(|source| distribution_error(table, "inspect", source))?
        {
            Some(current) if current == column => {
                debug!(table, column, "Table already distributed on column");
                return Ok(false);
            }
            Some(current) => {
                debug!(table, from = %current, to = column, "Changing distribution column");
                self.backend
                    .undistribute_table(table)
                    .await
                    .map_err(|source| distribution_error(table, "undistribute", source))?;
            }
            None => {}
        }
        self.backend
            .create_distributed_table(table, column)
            .await
            .map_err(|source| distribution_error(table, "distribute", source))?;
        info!(table, column, "Table distributed");
        Ok(true)
    }
}

fn distribution_error(table: &str, action: &'static str, source: DbErr) -> BackfillError {
    BackfillError::Distribution {
        table: table.to_owned(),
        action,
        source,
    }
}
