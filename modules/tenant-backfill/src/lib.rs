//! Tenant attribution backfill engine.
//!
//! Populates `tenant_code` / `organization_code` across an ordered catalog of
//! tables, from an organization mapping file and from already-resolved
//! upstream tables. A run either completes and validates, or is rolled back
//! from its pre-mutation snapshot.

pub mod config;
pub mod domain;
pub mod infra;

pub use config::{BackfillConfig, BackfillSettings};
pub use domain::engine::{BackfillEngine, MutationProgress, RollbackCoordinator};
pub use domain::error::BackfillError;
pub use domain::mapping::{LookupCacheBuilder, OrganizationMapping, TenantIdentity};
pub use domain::preflight::PreflightReport;
pub use domain::registry::{ResolutionStrategy, TableDescriptor, TableRegistry, TargetColumn};
pub use domain::report::{RollbackReport, RollbackStatus, RunOutcome, RunReport};
pub use domain::snapshot::Snapshot;
pub use domain::stats::RunStatistics;
