//! Run statistics and the anomaly log.

use super::mapping::MappingLoadStats;
use super::registry::ResolutionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why rows of a key could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// Organization id absent from the mapping cache.
    Unmapped,
    /// Upstream row exists but carries no tenant identity itself.
    UpstreamUnresolved,
    /// No upstream row with this key and orphans are not defaulted.
    UpstreamMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMapping {
    pub table: String,
    pub key_column: String,
    pub key_value: i64,
    pub rows: u64,
    pub reason: MissingReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultReason {
    /// Join key holds the system sentinel.
    SystemSentinel,
    /// Join key is NULL on a table whose NULL keys denote global rows.
    NullKey,
    /// Table has no linkage at all.
    DefaultsOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultedRows {
    pub table: String,
    pub rows: u64,
    pub reason: DefaultReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedReference {
    pub table: String,
    pub key_column: String,
    pub key_value: i64,
    pub rows: u64,
}

/// Rows with a NULL join key that neither resolve nor default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataIntegrityRows {
    pub table: String,
    pub key_column: String,
    pub rows: u64,
    pub sample_row_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedConstraint {
    pub table: String,
    pub constraint: String,
    pub referenced_table: String,
    pub reason: String,
}

/// Non-fatal findings collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomalies {
    pub missing_mappings: Vec<MissingMapping>,
    pub defaulted_rows: Vec<DefaultedRows>,
    pub orphaned_references: Vec<OrphanedReference>,
    pub skipped_constraints: Vec<SkippedConstraint>,
    #[serde(default)]
    pub data_integrity: Vec<DataIntegrityRows>,
}

impl Anomalies {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing_mappings.is_empty()
            && self.defaulted_rows.is_empty()
            && self.orphaned_references.is_empty()
            && self.skipped_constraints.is_empty()
            && self.data_integrity.is_empty()
    }
}

/// Counters accumulated across the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub mapping: MappingLoadStats,
    pub rows_updated_by_phase: BTreeMap<String, u64>,
    pub rows_updated_by_table: BTreeMap<String, u64>,
    pub rows_defaulted_by_table: BTreeMap<String, u64>,
    pub constraints_dropped: u64,
    pub constraints_restored: u64,
    pub constraints_adapted: u64,
    pub tables_undistributed: Vec<String>,
    pub tables_redistributed: Vec<String>,
    pub anomalies: Anomalies,
}

impl RunStatistics {
    /// Record rows filled from a resolved identity.
    pub fn record_updated(&mut self, strategy: ResolutionStrategy, table: &str, rows: u64) {
        if rows == 0 {
            return;
        }
        *self
            .rows_updated_by_phase
            .entry(strategy.as_str().to_owned())
            .or_default() += rows;
        *self.rows_updated_by_table.entry(table.to_owned()).or_default() += rows;
    }

    /// Record rows filled with the configured defaults.
    pub fn record_defaulted(
        &mut self,
        strategy: ResolutionStrategy,
        table: &str,
        rows: u64,
        reason: DefaultReason,
    ) {
        if rows == 0 {
            return;
        }
        self.record_updated(strategy, table, rows);
        *self
            .rows_defaulted_by_table
            .entry(table.to_owned())
            .or_default() += rows;
        self.anomalies.defaulted_rows.push(DefaultedRows {
            table: table.to_owned(),
            rows,
            reason,
        });
    }

    #[must_use]
    pub fn total_rows_updated(&self) -> u64 {
        self.rows_updated_by_table.values().sum()
    }
}
