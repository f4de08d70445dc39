//! Citus distribution backend, plus the no-op backend for databases without
//! horizontal partitioning.

use crate::domain::partition::DistributionBackend;
use crate::domain::sql::quote_ident;
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement, Value};

const EXTENSION_SQL: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'citus') AS active";

const DISTRIBUTION_COLUMN_SQL: &str = r"
SELECT column_to_column_name(logicalrelid, partkey)::text AS column_name
  FROM pg_dist_partition
 WHERE logicalrelid = to_regclass($1) AND partkey IS NOT NULL";

pub struct CitusDistribution {
    conn: DatabaseConnection,
}

impl CitusDistribution {
    #[must_use]
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    async fn call(&self, sql: &str, values: Vec<Value>) -> Result<(), DbErr> {
        self.conn
            .execute(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DistributionBackend for CitusDistribution {
    async fn extension_active(&self) -> Result<bool, DbErr> {
        let row = self
            .conn
            .query_one(Statement::from_string(DbBackend::Postgres, EXTENSION_SQL))
            .await?;
        match row {
            Some(row) => row.try_get("", "active"),
            None => Ok(false),
        }
    }

    async fn distribution_column(&self, table: &str) -> Result<Option<String>, DbErr> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                DISTRIBUTION_COLUMN_SQL,
                [Value::from(quote_ident(table))],
            ))
            .await?;
        match row {
            Some(row) => row.try_get("", "column_name"),
            None => Ok(None),
        }
    }

    async fn undistribute_table(&self, table: &str) -> Result<(), DbErr> {
        self.call(
            "SELECT undistribute_table($1::regclass)",
            vec![Value::from(quote_ident(table))],
        )
        .await
    }

    async fn create_distributed_table(&self, table: &str, column: &str) -> Result<(), DbErr> {
        self.call(
            "SELECT create_distributed_table($1::regclass, $2)",
            vec![Value::from(quote_ident(table)), Value::from(column.to_owned())],
        )
        .await
    }
}

/// Backend for databases without a distribution extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDistribution;

#[async_trait]
impl DistributionBackend for NoDistribution {
    async fn extension_active(&self) -> Result<bool, DbErr> {
        Ok(false)
    }

    async fn distribution_column(&self, _table: &str) -> Result<Option<String>, DbErr> {
        Ok(None)
    }

    async fn undistribute_table(&self, table: &str) -> Result<(), DbErr> {
        Err(DbErr::Custom(format!("{table}: no distribution extension")))
    }

    async fn create_distributed_table(&self, table: &str, _column: &str) -> Result<(), DbErr> {
        Err(DbErr::Custom(format!("{table}: no distribution extension")))
    }
}
