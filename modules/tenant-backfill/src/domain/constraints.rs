//! Foreign-key suspension and restoration.
//!
//! Constraints touching an affected table are discovered once, dropped before
//! any update, and recreated afterwards. When both ends of a constraint end up
//! distributed on `tenant_code`, the constraint must include the partition key;
//! known pairs are recreated in that adapted form, unknown ones are skipped and
//! reported.

use super::error::BackfillError;
use super::registry::TENANT_CODE;
use super::sql::quote_ident;
use super::stats::{RunStatistics, SkippedConstraint};
use async_trait::async_trait;
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `(referencing table, referenced table)` pairs whose constraints are rebuilt
/// with `tenant_code` prepended once both tables are partitioned.
pub const PARTITION_KEY_ADAPTABLE: &[(&str, &str)] = &[
    ("user_extensions", "organization_extension"),
    ("session_attendees", "sessions"),
    ("feedbacks", "sessions"),
    ("post_session_details", "sessions"),
    ("resources", "sessions"),
    ("entities", "entity_types"),
    ("questions", "question_sets"),
    ("connections", "user_extensions"),
    ("connection_requests", "user_extensions"),
    ("sessions", "user_extensions"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// `pg_constraint.confdeltype` / `confupdtype` code.
    #[must_use]
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => Self::Restrict,
            "c" => Self::Cascade,
            "n" => Self::SetNull,
            "d" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    /// SQL keyword as reported by `pragma_foreign_key_list`.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => Self::Restrict,
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// Captured definition of a foreign key, sufficient to recreate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDescriptor {
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
}

impl ConstraintDescriptor {
    #[must_use]
    pub fn includes_partition_key(&self) -> bool {
        self.columns.iter().any(|c| c == TENANT_CODE)
            && self.referenced_columns.iter().any(|c| c == TENANT_CODE)
    }

    /// Copy with `tenant_code` leading both column lists.
    #[must_use]
    pub fn with_partition_key(&self) -> Self {
        let prepend = |cols: &[String]| {
            std::iter::once(TENANT_CODE.to_owned())
                .chain(cols.iter().filter(|c| *c != TENANT_CODE).cloned())
                .collect()
        };
        Self {
            columns: prepend(&self.columns),
            referenced_columns: prepend(&self.referenced_columns),
            ..self.clone()
        }
    }

    /// `FOREIGN KEY (...) REFERENCES t (...) ON DELETE .. ON UPDATE ..`
    #[must_use]
    pub fn definition_sql(&self) -> String {
        let list = |cols: &[String]| {
            cols.iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            list(&self.columns),
            quote_ident(&self.referenced_table),
            list(&self.referenced_columns),
            self.on_delete.as_sql(),
            self.on_update.as_sql(),
        )
    }
}

/// Database-specific constraint catalog.
#[async_trait]
pub trait ConstraintCatalog: Send + Sync {
    /// Foreign keys whose referencing or referenced table is in `tables`.
    async fn discover(&self, tables: &[&str]) -> Result<Vec<ConstraintDescriptor>, DbErr>;

    async fn exists(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr>;

    /// Drop the constraint; `false` when nothing was dropped.
    async fn drop_constraint(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr>;

    async fn create(&self, constraint: &ConstraintDescriptor) -> Result<(), DbErr>;
}

/// How a suspended constraint came back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreAction {
    Verbatim,
    Adapted,
    AlreadyPresent,
    Skipped(String),
}

pub struct ConstraintSuspensionManager {
    catalog: Arc<dyn ConstraintCatalog>,
    adaptable: HashSet<(String, String)>,
}

impl ConstraintSuspensionManager {
    #[must_use]
    pub fn new(catalog: Arc<dyn ConstraintCatalog>) -> Self {
        Self::with_adaptable(catalog, PARTITION_KEY_ADAPTABLE)
    }

    #[must_use]
    pub fn with_adaptable(catalog: Arc<dyn ConstraintCatalog>, pairs: &[(&str, &str)]) -> Self {
        Self {
            catalog,
            adaptable: pairs
                .iter()
                .map(|(a, b)| ((*a).to_owned(), (*b).to_owned()))
                .collect(),
        }
    }

    /// Read-only discovery of every constraint touching `tables`.
    ///
    /// # Errors
    /// Returns `BackfillError::Db` when the catalog cannot be queried.
    pub async fn discover(&self, tables: &[&str]) -> Result<Vec<ConstraintDescriptor>, BackfillError> {
        let found = self.catalog.discover(tables).await?;
        info!(constraints = found.len(), "Discovered foreign keys on affected tables");
        Ok(found)
    }

    /// Drop `constraints`, appending each dropped one to `dropped`.
    ///
    /// # Errors
    /// Any drop failure is fatal and returned as `BackfillError::Constraint`;
    /// `dropped` then lists what must be restored.
    pub async fn suspend(
        &self,
        constraints: &[ConstraintDescriptor],
        dropped: &mut Vec<ConstraintDescriptor>,
        stats: &mut RunStatistics,
    ) -> Result<(), BackfillError> {
        for constraint in constraints {
            match self.catalog.drop_constraint(constraint).await {
                Ok(true) => {
                    debug!(table = %constraint.table, constraint = %constraint.name, "Dropped foreign key");
                    stats.constraints_dropped += 1;
                    dropped.push(constraint.clone());
                }
                Ok(false) => {
                    debug!(table = %constraint.table, constraint = %constraint.name, "Foreign key left in place");
                }
                Err(source) => {
                    return Err(BackfillError::Constraint {
                        table: constraint.table.clone(),
                        constraint: constraint.name.clone(),
                        source,
                    });
                }
            }
        }
        info!(dropped = dropped.len(), "Foreign keys suspended");
        Ok(())
    }

    /// Recreate suspended constraints.
    ///
    /// `partitioned` lists tables currently distributed on `tenant_code`.
    /// Failures never abort; they are recorded as skipped constraints.
    pub async fn restore(
        &self,
        constraints: &[ConstraintDescriptor],
        partitioned: &HashSet<String>,
        stats: &mut RunStatistics,
    ) -> Vec<RestoreAction> {
        let mut actions = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            let action = self.restore_one(constraint, partitioned).await;
            match &action {
                RestoreAction::Verbatim => stats.constraints_restored += 1,
                RestoreAction::Adapted => {
                    stats.constraints_restored += 1;
                    stats.constraints_adapted += 1;
                }
                RestoreAction::AlreadyPresent => {}
                RestoreAction::Skipped(reason) => {
                    warn!(table = %constraint.table, constraint = %constraint.name, %reason, "Foreign key not restored");
                    stats.anomalies.skipped_constraints.push(SkippedConstraint {
                        table: constraint.table.clone(),
                        constraint: constraint.name.clone(),
                        referenced_table: constraint.referenced_table.clone(),
                        reason: reason.clone(),
                    });
                }
            }
            actions.push(action);
        }
        info!(
            restored = stats.constraints_restored,
            adapted = stats.constraints_adapted,
            skipped = stats.anomalies.skipped_constraints.len(),
            "Foreign keys restored"
        );
        actions
    }

    async fn restore_one(
        &self,
        constraint: &ConstraintDescriptor,
        partitioned: &HashSet<String>,
    ) -> RestoreAction {
        match self.catalog.exists(constraint).await {
            Ok(true) => return RestoreAction::AlreadyPresent,
            Ok(false) => {}
            Err(e) => return RestoreAction::Skipped(format!("existence check failed: {e}")),
        }

        let both_partitioned = partitioned.contains(&constraint.table)
            && partitioned.contains(&constraint.referenced_table);
        if !both_partitioned || constraint.includes_partition_key() {
            return match self.catalog.create(constraint).await {
                Ok(()) => RestoreAction::Verbatim,
                Err(e) => RestoreAction::Skipped(e.to_string()),
            };
        }

        let pair = (constraint.table.clone(), constraint.referenced_table.clone());
        if !self.adaptable.contains(&pair) {
            return RestoreAction::Skipped(format!(
                "both tables are distributed on {TENANT_CODE} and the pair has no partition-key adaptation"
            ));
        }
        match self.catalog.create(&constraint.with_partition_key()).await {
            Ok(()) => {
                info!(table = %constraint.table, constraint = %constraint.name, "Foreign key recreated with partition key");
                RestoreAction::Adapted
            }
            Err(e) => RestoreAction::Skipped(format!("adapted constraint rejected: {e}")),
        }
    }
}
