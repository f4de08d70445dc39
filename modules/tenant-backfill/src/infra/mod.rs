pub mod citus;
pub mod pg_catalog;
pub mod sqlite_catalog;

use crate::domain::constraints::ConstraintCatalog;
use crate::domain::error::BackfillError;
use crate::domain::partition::DistributionBackend;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend};
use std::sync::Arc;

pub type Adapters = (Arc<dyn ConstraintCatalog>, Arc<dyn DistributionBackend>);

/// Constraint catalog and distribution backend for the connection's engine.
///
/// # Errors
/// Returns `BackfillError::Configuration` for `MySQL` connections.
pub fn adapters_for(conn: &DatabaseConnection) -> Result<Adapters, BackfillError> {
    match conn.get_database_backend() {
        DbBackend::Postgres => Ok((
            Arc::new(pg_catalog::PgConstraintCatalog::new(conn.clone())),
            Arc::new(citus::CitusDistribution::new(conn.clone())),
        )),
        DbBackend::Sqlite => Ok((
            Arc::new(sqlite_catalog::SqliteConstraintCatalog::new(conn.clone())),
            Arc::new(citus::NoDistribution),
        )),
        DbBackend::MySql => Err(BackfillError::Configuration(
            "MySQL is not supported".to_owned(),
        )),
    }
}
