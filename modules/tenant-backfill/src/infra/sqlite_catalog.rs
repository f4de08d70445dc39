//! `SQLite` foreign-key catalog.
//!
//! `SQLite` keeps foreign keys inside the table definition and cannot drop
//! them. Tenant columns never take part in them, so suspension is a no-op and
//! discovery is informational.

use crate::domain::constraints::{ConstraintCatalog, ConstraintDescriptor, ReferentialAction};
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};
use std::collections::BTreeMap;
use tracing::debug;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT m.name AS table_name,
       p.id AS fk_id,
       p."table" AS referenced_table,
       p."from" AS from_column,
       p."to" AS to_column,
       p.on_update AS on_update,
       p.on_delete AS on_delete
  FROM sqlite_master m
  JOIN pragma_foreign_key_list(m.name) p
 WHERE m.type = 'table'
 ORDER BY m.name, p.id, p.seq"#;

pub struct SqliteConstraintCatalog {
    conn: DatabaseConnection,
}

impl SqliteConstraintCatalog {
    #[must_use]
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    async fn all(&self) -> Result<Vec<ConstraintDescriptor>, DbErr> {
        let rows = self
            .conn
            .query_all(Statement::from_string(DbBackend::Sqlite, FOREIGN_KEYS_SQL))
            .await?;

        let mut grouped: BTreeMap<(String, i64), ConstraintDescriptor> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("", "table_name")?;
            let id: i64 = row.try_get("", "fk_id")?;
            let from: String = row.try_get("", "from_column")?;
            // NULL "to" references the parent's primary key.
            let to: Option<String> = row.try_get("", "to_column")?;
            let entry = grouped
                .entry((table.clone(), id))
                .or_insert(ConstraintDescriptor {
                    name: format!("fk_{table}_{id}"),
                    table,
                    columns: Vec::new(),
                    referenced_table: row.try_get("", "referenced_table")?,
                    referenced_columns: Vec::new(),
                    on_delete: ReferentialAction::from_keyword(&row.try_get::<String>("", "on_delete")?),
                    on_update: ReferentialAction::from_keyword(&row.try_get::<String>("", "on_update")?),
                });
            entry.columns.push(from);
            entry.referenced_columns.push(to.unwrap_or_else(|| "rowid".to_owned()));
        }
        Ok(grouped.into_values().collect())
    }
}

#[async_trait]
impl ConstraintCatalog for SqliteConstraintCatalog {
    async fn discover(&self, tables: &[&str]) -> Result<Vec<ConstraintDescriptor>, DbErr> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|c| {
                tables.contains(&c.table.as_str()) || tables.contains(&c.referenced_table.as_str())
            })
            .collect())
    }

    async fn exists(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr> {
        Ok(self.all().await?.iter().any(|c| {
            c.table == constraint.table
                && c.referenced_table == constraint.referenced_table
                && c.columns == constraint.columns
        }))
    }

    async fn drop_constraint(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr> {
        debug!(table = %constraint.table, constraint = %constraint.name, "SQLite foreign keys stay in the table definition");
        Ok(false)
    }

    async fn create(&self, constraint: &ConstraintDescriptor) -> Result<(), DbErr> {
        Err(DbErr::Custom(format!(
            "SQLite cannot add constraint {} to existing table {}",
            constraint.name, constraint.table
        )))
    }
}
