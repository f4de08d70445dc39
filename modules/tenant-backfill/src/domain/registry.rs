//! Table descriptor registry.
//!
//! A fixed, ordered catalog of the tables that receive `tenant_code` /
//! `organization_code`. Catalog order is the execution order, and it is
//! checked when the registry is built: every join strategy must find its
//! upstream table earlier in the list, and strategies appear in phase order
//! (direct organization lookups first, defaults-only tables last).

use super::error::BackfillError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const TENANT_CODE: &str = "tenant_code";
pub const ORGANIZATION_CODE: &str = "organization_code";
pub const UPDATED_AT: &str = "updated_at";

/// Organization registry whose ids the mapping file must fully cover.
pub const SOURCE_OF_TRUTH_TABLE: &str = "organization_extension";
pub const SOURCE_OF_TRUTH_KEY: &str = "organization_id";

/// Canonical user-identity table; itself resolved by organization id.
pub const USER_IDENTITY_TABLE: &str = "user_extensions";

/// Join-key value used for rows authored by the system rather than a user.
pub const SYSTEM_SENTINEL: i64 = 0;

/// One of the two backfilled columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetColumn {
    TenantCode,
    OrganizationCode,
}

impl TargetColumn {
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::TenantCode => TENANT_CODE,
            Self::OrganizationCode => ORGANIZATION_CODE,
        }
    }
}

const BOTH: &[TargetColumn] = &[TargetColumn::TenantCode, TargetColumn::OrganizationCode];
const TENANT_ONLY: &[TargetColumn] = &[TargetColumn::TenantCode];

/// Where an upstream strategy reads its resolved identity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upstream {
    pub table: &'static str,
    pub key_column: &'static str,
}

/// How a table's tenant identity is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// `organization_id` column looked up in the mapping cache.
    OrgIdDirect,
    /// User id joined against the already-resolved user-identity table.
    UserIdJoin,
    SessionJoin,
    EntityTypeJoin,
    ReportTypeJoin,
    ReportJoin,
    /// No linkage; every unresolved row receives the configured defaults.
    DefaultsOnly,
}

impl ResolutionStrategy {
    /// Upstream table for join strategies.
    #[must_use]
    pub const fn upstream(self) -> Option<Upstream> {
        match self {
            Self::OrgIdDirect | Self::DefaultsOnly => None,
            Self::UserIdJoin => Some(Upstream {
                table: USER_IDENTITY_TABLE,
                key_column: "user_id",
            }),
            Self::SessionJoin => Some(Upstream {
                table: "sessions",
                key_column: "id",
            }),
            Self::EntityTypeJoin => Some(Upstream {
                table: "entity_types",
                key_column: "id",
            }),
            Self::ReportTypeJoin => Some(Upstream {
                table: "report_types",
                key_column: "id",
            }),
            Self::ReportJoin => Some(Upstream {
                table: "reports",
                key_column: "id",
            }),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrgIdDirect => "org_id_direct",
            Self::UserIdJoin => "user_id_join",
            Self::SessionJoin => "session_join",
            Self::EntityTypeJoin => "entity_type_join",
            Self::ReportTypeJoin => "report_type_join",
            Self::ReportJoin => "report_join",
            Self::DefaultsOnly => "defaults_only",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one affected table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub strategy: ResolutionStrategy,
    pub targets: &'static [TargetColumn],
    /// Linkage column; `None` only for [`ResolutionStrategy::DefaultsOnly`].
    pub join_key: Option<&'static str>,
    /// Integer row identity used by snapshots and sample ids.
    pub row_id: &'static str,
    pub partitioned: bool,
    /// Join-key value that marks system-authored rows (defaulted, never flagged).
    pub system_sentinel: Option<i64>,
    /// NULL join key denotes a global row that receives the defaults.
    /// When false such rows are a data-integrity error.
    pub default_null_keys: bool,
    /// Keys absent from the upstream table are defaulted and reported as orphans.
    pub default_orphans: bool,
}

impl TableDescriptor {
    const fn base(name: &'static str, strategy: ResolutionStrategy, join_key: Option<&'static str>) -> Self {
        Self {
            name,
            strategy,
            targets: BOTH,
            join_key,
            row_id: "id",
            partitioned: false,
            system_sentinel: None,
            default_null_keys: false,
            default_orphans: false,
        }
    }

    #[must_use]
    pub const fn org_direct(name: &'static str) -> Self {
        Self::base(name, ResolutionStrategy::OrgIdDirect, Some("organization_id"))
    }

    /// Join strategy keyed by `join_key`; user joins carry the system sentinel.
    #[must_use]
    pub const fn joined(name: &'static str, strategy: ResolutionStrategy, join_key: &'static str) -> Self {
        let mut d = Self::base(name, strategy, Some(join_key));
        if matches!(strategy, ResolutionStrategy::UserIdJoin) {
            d.system_sentinel = Some(SYSTEM_SENTINEL);
            d.default_orphans = true;
        }
        d
    }

    #[must_use]
    pub const fn defaults_only(name: &'static str) -> Self {
        Self::base(name, ResolutionStrategy::DefaultsOnly, None)
    }

    #[must_use]
    pub const fn row_id(mut self, column: &'static str) -> Self {
        self.row_id = column;
        self
    }

    #[must_use]
    pub const fn tenant_only(mut self) -> Self {
        self.targets = TENANT_ONLY;
        self
    }

    #[must_use]
    pub const fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }

    #[must_use]
    pub const fn default_null_keys(mut self) -> Self {
        self.default_null_keys = true;
        self
    }

    #[must_use]
    pub const fn without_orphan_defaults(mut self) -> Self {
        self.default_orphans = false;
        self
    }

    #[must_use]
    pub fn targets_column(&self, column: TargetColumn) -> bool {
        self.targets.contains(&column)
    }
}

/// Consecutive catalog entries sharing one strategy.
#[derive(Debug, Clone)]
pub struct Phase<'a> {
    pub strategy: ResolutionStrategy,
    pub tables: Vec<&'a TableDescriptor>,
}

/// Validated, ordered catalog.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: Vec<TableDescriptor>,
}

impl TableRegistry {
    /// Validate and wrap a catalog.
    ///
    /// # Errors
    /// Returns `BackfillError::Registry` when names repeat, identifiers are not
    /// plain SQL identifiers, targets are empty, a partitioned table does not
    /// target `tenant_code`, strategies are out of phase order, or an upstream
    /// table is missing or listed after its dependent.
    pub fn new(tables: Vec<TableDescriptor>) -> Result<Self, BackfillError> {
        validate(&tables)?;
        Ok(Self { tables })
    }

    /// The built-in mentoring catalog.
    ///
    /// # Errors
    /// Returns `BackfillError::Registry` if the built-in catalog is inconsistent.
    pub fn mentoring() -> Result<Self, BackfillError> {
        Self::new(mentoring_catalog())
    }

    #[must_use]
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tables.iter().map(|t| t.name).collect()
    }

    /// Tables grouped into execution phases, in catalog order.
    #[must_use]
    pub fn phases(&self) -> Vec<Phase<'_>> {
        let mut phases: Vec<Phase<'_>> = Vec::new();
        for table in &self.tables {
            match phases.last_mut() {
                Some(phase) if phase.strategy == table.strategy => phase.tables.push(table),
                _ => phases.push(Phase {
                    strategy: table.strategy,
                    tables: vec![table],
                }),
            }
        }
        phases
    }

    /// Partitioned tables, in catalog order.
    pub fn partitioned(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter().filter(|t| t.partitioned)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn validate(tables: &[TableDescriptor]) -> Result<(), BackfillError> {
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut last_strategy: Option<ResolutionStrategy> = None;

    for (idx, table) in tables.iter().enumerate() {
        let name = table.name;
        let idents = [Some(name), Some(table.row_id), table.join_key];
        if let Some(bad) = idents.into_iter().flatten().find(|i| !is_identifier(i)) {
            return Err(BackfillError::Registry(format!(
                "{name}: '{bad}' is not a plain SQL identifier"
            )));
        }
        if position.insert(name, idx).is_some() {
            return Err(BackfillError::Registry(format!("{name} is listed twice")));
        }
        if table.targets.is_empty() {
            return Err(BackfillError::Registry(format!("{name} has no target columns")));
        }
        if table.partitioned && !table.targets_column(TargetColumn::TenantCode) {
            return Err(BackfillError::Registry(format!(
                "{name} is partitioned but does not receive {TENANT_CODE}"
            )));
        }
        let defaults_only = table.strategy == ResolutionStrategy::DefaultsOnly;
        if defaults_only == table.join_key.is_some() {
            return Err(BackfillError::Registry(format!(
                "{name}: only {} tables may omit the join key",
                ResolutionStrategy::DefaultsOnly
            )));
        }
        if let Some(prev) = last_strategy
            && table.strategy < prev
        {
            return Err(BackfillError::Registry(format!(
                "{name} ({}) is listed after a {prev} table",
                table.strategy
            )));
        }
        last_strategy = Some(table.strategy);

        if let Some(upstream) = table.strategy.upstream() {
            let Some(&up_idx) = position.get(upstream.table) else {
                return Err(BackfillError::Registry(format!(
                    "{name} depends on {} which is not resolved before it",
                    upstream.table
                )));
            };
            let up = &tables[up_idx];
            if let Some(missing) = table.targets.iter().find(|t| !up.targets.contains(t)) {
                return Err(BackfillError::Registry(format!(
                    "{name} needs {} from {} which does not receive it",
                    missing.column(),
                    upstream.table
                )));
            }
        }
    }
    Ok(())
}

/// Affected tables of the mentoring schema, in execution order.
#[must_use]
pub fn mentoring_catalog() -> Vec<TableDescriptor> {
    use ResolutionStrategy::{EntityTypeJoin, ReportJoin, ReportTypeJoin, SessionJoin, UserIdJoin};

    vec![
        TableDescriptor::org_direct(SOURCE_OF_TRUTH_TABLE)
            .row_id(SOURCE_OF_TRUTH_KEY)
            .partitioned(),
        TableDescriptor::org_direct(USER_IDENTITY_TABLE)
            .row_id("user_id")
            .partitioned(),
        TableDescriptor::org_direct("entity_types")
            .partitioned()
            .default_null_keys(),
        TableDescriptor::org_direct("forms").default_null_keys(),
        TableDescriptor::org_direct("notification_templates").default_null_keys(),
        TableDescriptor::org_direct("default_rules"),
        TableDescriptor::org_direct("role_extensions"),
        TableDescriptor::org_direct("file_uploads"),
        TableDescriptor::org_direct("report_types").default_null_keys(),
        TableDescriptor::joined("sessions", UserIdJoin, "created_by").partitioned(),
        TableDescriptor::joined("session_request", UserIdJoin, "requestor_id").partitioned(),
        TableDescriptor::joined("connections", UserIdJoin, "user_id").partitioned(),
        TableDescriptor::joined("connection_requests", UserIdJoin, "user_id").partitioned(),
        TableDescriptor::joined("availabilities", UserIdJoin, "user_id"),
        TableDescriptor::joined("question_sets", UserIdJoin, "created_by")
            .partitioned()
            .default_null_keys(),
        TableDescriptor::joined("questions", UserIdJoin, "created_by")
            .partitioned()
            .default_null_keys(),
        TableDescriptor::joined("issues", UserIdJoin, "user_id").without_orphan_defaults(),
        TableDescriptor::joined("session_attendees", SessionJoin, "session_id")
            .tenant_only()
            .partitioned(),
        TableDescriptor::joined("feedbacks", SessionJoin, "session_id")
            .tenant_only()
            .partitioned(),
        TableDescriptor::joined("post_session_details", SessionJoin, "session_id")
            .row_id("session_id")
            .tenant_only()
            .partitioned(),
        TableDescriptor::joined("resources", SessionJoin, "session_id").partitioned(),
        TableDescriptor::joined("entities", EntityTypeJoin, "entity_type_id").partitioned(),
        TableDescriptor::joined("reports", ReportTypeJoin, "report_type_id"),
        TableDescriptor::joined("report_queries", ReportJoin, "report_id"),
        TableDescriptor::joined("report_role_mapping", ReportJoin, "report_id"),
        TableDescriptor::defaults_only("permissions").tenant_only(),
        TableDescriptor::defaults_only("modules").tenant_only(),
        TableDescriptor::defaults_only("role_permission_mapping"),
    ]
}
