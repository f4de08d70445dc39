//! `PostgreSQL` foreign-key catalog backed by `pg_constraint`.

use crate::domain::constraints::{ConstraintCatalog, ConstraintDescriptor, ReferentialAction};
use crate::domain::sql::quote_ident;
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement, Value};
use tracing::debug;

const DISCOVER_SQL: &str = r"
SELECT con.conname::text AS constraint_name,
       src.relname::text AS table_name,
       dst.relname::text AS referenced_table,
       con.confdeltype::text AS on_delete,
       con.confupdtype::text AS on_update,
       (SELECT string_agg(a.attname::text, ',' ORDER BY k.ord)
          FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
          JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum) AS columns,
       (SELECT string_agg(a.attname::text, ',' ORDER BY k.ord)
          FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
          JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum) AS referenced_columns
  FROM pg_constraint con
  JOIN pg_class src ON src.oid = con.conrelid
  JOIN pg_class dst ON dst.oid = con.confrelid
  JOIN pg_namespace ns ON ns.oid = src.relnamespace
 WHERE con.contype = 'f'
   AND ns.nspname = current_schema()
   AND (src.relname::text = ANY(string_to_array($1, ',')) OR dst.relname::text = ANY(string_to_array($1, ',')))
 ORDER BY src.relname, con.conname";

const EXISTS_SQL: &str = r"
SELECT EXISTS (
    SELECT 1 FROM pg_constraint
     WHERE conname = $1 AND conrelid = to_regclass($2) AND contype = 'f'
) AS present";

pub struct PgConstraintCatalog {
    conn: DatabaseConnection,
}

impl PgConstraintCatalog {
    #[must_use]
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }
}

fn split(list: Option<String>) -> Vec<String> {
    list.unwrap_or_default()
        .split(',')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl ConstraintCatalog for PgConstraintCatalog {
    async fn discover(&self, tables: &[&str]) -> Result<Vec<ConstraintDescriptor>, DbErr> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            DISCOVER_SQL,
            [Value::from(tables.join(","))],
        );
        let rows = self.conn.query_all(stmt).await?;
        rows.iter()
            .map(|row| {
                Ok(ConstraintDescriptor {
                    table: row.try_get("", "table_name")?,
                    name: row.try_get("", "constraint_name")?,
                    columns: split(row.try_get("", "columns")?),
                    referenced_table: row.try_get("", "referenced_table")?,
                    referenced_columns: split(row.try_get("", "referenced_columns")?),
                    on_delete: ReferentialAction::from_pg_code(&row.try_get::<String>("", "on_delete")?),
                    on_update: ReferentialAction::from_pg_code(&row.try_get::<String>("", "on_update")?),
                })
            })
            .collect()
    }

    async fn exists(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            EXISTS_SQL,
            [
                Value::from(constraint.name.clone()),
                Value::from(quote_ident(&constraint.table)),
            ],
        );
        match self.conn.query_one(stmt).await? {
            Some(row) => row.try_get("", "present"),
            None => Ok(false),
        }
    }

    async fn drop_constraint(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr> {
        if !self.exists(constraint).await? {
            debug!(table = %constraint.table, constraint = %constraint.name, "Constraint already absent");
            return Ok(false);
        }
        let sql = format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            quote_ident(&constraint.table),
            quote_ident(&constraint.name)
        );
        self.conn
            .execute(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        Ok(true)
    }

    async fn create(&self, constraint: &ConstraintDescriptor) -> Result<(), DbErr> {
        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            quote_ident(&constraint.table),
            quote_ident(&constraint.name),
            constraint.definition_sql()
        );
        self.conn
            .execute(Statement::from_string(DbBackend::Postgres, sql))
            .await?;
        Ok(())
    }
}
