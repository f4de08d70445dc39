#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end runs against an in-memory `SQLite` database.

mod common;

use common::{
    UNTOUCHED_AT, base_fixture, codes, connect, engine, exec, seed, settings, some,
    standard_mapping, updated_at,
};
use sea_orm::{ConnectionTrait, DbBackend, Statement};
use tenant_backfill::domain::executor::ResolutionExecutor;
use tenant_backfill::domain::stats::MissingReason;
use tenant_backfill::{
    BackfillError, MutationProgress, OrganizationMapping, RollbackCoordinator, RollbackStatus,
    RunOutcome, RunReport, RunStatistics, Snapshot, TableRegistry, TenantIdentity,
};

/// Rows touching every phase of the mentoring catalog.
async fn seed_all_phases(conn: &sea_orm::DatabaseConnection) {
    seed(
        conn,
        &[
            "INSERT INTO sessions (id, created_by) VALUES (500, 10), (501, 0), (502, 999)",
            "INSERT INTO session_attendees (id, session_id) VALUES (600, 500), (601, 502)",
            "INSERT INTO entity_types (id, organization_id) VALUES (100, 1), (101, NULL)",
            "INSERT INTO entities (id, entity_type_id) VALUES (700, 100), (701, 101)",
            "INSERT INTO report_types (id, organization_id) VALUES (300, 2)",
            "INSERT INTO reports (id, report_type_id) VALUES (310, 300)",
            "INSERT INTO report_queries (id, report_id) VALUES (320, 310)",
            "INSERT INTO permissions (id) VALUES (900)",
            "INSERT INTO forms (id, organization_id, tenant_code) VALUES (800, 1, 'keep')",
            "INSERT INTO forms (id, organization_id, tenant_code, organization_code) VALUES (801, 2, '', '')",
            "INSERT INTO forms (id, organization_id, tenant_code, organization_code) VALUES (802, 1, 'x', 'y')",
        ],
    )
    .await;
}

async fn read_report(path: &std::path::Path) -> RunReport {
    let body = tokio::fs::read(path).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn full_run_resolves_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;
    let settings = settings(dir.path(), standard_mapping(dir.path()));
    let report_path = settings.report_path.clone();
    let snapshot_path = settings.snapshot_path.clone().unwrap();

    let report = engine(&conn, settings).run().await;

    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.rollback.status, RollbackStatus::NotNeeded);
    assert!(report.validation.as_ref().unwrap().passed);

    assert_eq!(codes(&conn, "organization_extension", 1).await, some("acme", "org-one"));
    assert_eq!(codes(&conn, "user_extensions", 11).await, some("globex", "org-two"));
    assert_eq!(codes(&conn, "sessions", 500).await, some("acme", "org-one"));
    assert_eq!(codes(&conn, "sessions", 501).await, some("default", "default_code"));
    assert_eq!(codes(&conn, "sessions", 502).await, some("default", "default_code"));
    assert_eq!(
        codes(&conn, "session_attendees", 600).await,
        (Some("acme".to_owned()), None)
    );
    assert_eq!(
        codes(&conn, "session_attendees", 601).await,
        (Some("default".to_owned()), None)
    );
    assert_eq!(codes(&conn, "entity_types", 101).await, some("default", "default_code"));
    assert_eq!(codes(&conn, "entities", 700).await, some("acme", "org-one"));
    assert_eq!(codes(&conn, "entities", 701).await, some("default", "default_code"));
    assert_eq!(codes(&conn, "report_queries", 320).await, some("globex", "org-two"));
    assert_eq!(
        codes(&conn, "permissions", 900).await,
        (Some("default".to_owned()), None)
    );

    // Present values are never overwritten; blanks count as missing.
    assert_eq!(codes(&conn, "forms", 800).await, some("keep", "org-one"));
    assert_eq!(codes(&conn, "forms", 801).await, some("globex", "org-two"));
    assert_eq!(codes(&conn, "forms", 802).await, some("x", "y"));
    assert_eq!(updated_at(&conn, "forms", "id", 802).await, UNTOUCHED_AT);
    assert_ne!(updated_at(&conn, "sessions", "id", 500).await, UNTOUCHED_AT);

    let stats = &report.statistics;
    assert_eq!(stats.rows_updated_by_table["sessions"], 3);
    assert_eq!(stats.rows_defaulted_by_table["sessions"], 1);
    assert_eq!(stats.rows_updated_by_phase["report_join"], 1);
    assert!(stats.anomalies.missing_mappings.is_empty());
    let orphans = &stats.anomalies.orphaned_references;
    assert_eq!(orphans.len(), 1);
    assert_eq!((orphans[0].table.as_str(), orphans[0].key_value), ("sessions", 999));

    assert!(!snapshot_path.exists());
    let persisted = read_report(&report_path).await;
    assert_eq!(persisted.outcome, RunOutcome::Succeeded);
    assert_eq!(persisted.statistics.total_rows_updated(), stats.total_rows_updated());
}

#[tokio::test]
async fn sqlite_foreign_keys_stay_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;

    let report = engine(&conn, settings(dir.path(), standard_mapping(dir.path())))
        .run()
        .await;

    assert!(report.succeeded());
    assert_eq!(report.statistics.constraints_dropped, 0);
    assert!(report.statistics.anomalies.skipped_constraints.is_empty());
    let row = conn
        .query_one(Statement::from_string(
            DbBackend::Sqlite,
            "SELECT COUNT(*) AS n FROM pragma_foreign_key_list('entities')",
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<i64>("", "n").unwrap(), 1);
}

#[tokio::test]
async fn coverage_gap_aborts_before_any_change() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;
    seed(&conn, &["INSERT INTO organization_extension (organization_id) VALUES (3)"]).await;
    let settings = settings(dir.path(), standard_mapping(dir.path()));
    let snapshot_path = settings.snapshot_path.clone().unwrap();
    let report_path = settings.report_path.clone();

    let report = engine(&conn, settings).run().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_ne!(report.exit_code(), 0);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, "coverage_error");
    assert!(error.message.contains('3'), "{}", error.message);
    assert_eq!(report.rollback.status, RollbackStatus::NotNeeded);
    assert_eq!(report.statistics.total_rows_updated(), 0);

    assert_eq!(codes(&conn, "organization_extension", 1).await, (None, None));
    assert_eq!(codes(&conn, "sessions", 500).await, (None, None));
    assert!(!snapshot_path.exists());
    assert_eq!(read_report(&report_path).await.outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn null_join_key_triggers_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed(
        &conn,
        &[
            "INSERT INTO forms (id, organization_id, tenant_code, organization_code) VALUES (800, 1, NULL, '')",
            "INSERT INTO sessions (id, created_by) VALUES (500, 10), (503, NULL)",
        ],
    )
    .await;
    let settings = settings(dir.path(), standard_mapping(dir.path()));
    let snapshot_path = settings.snapshot_path.clone().unwrap();
    let report_path = settings.report_path.clone();

    let report = engine(&conn, settings).run().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, "data_integrity_error");
    let written = read_report(&report_path).await;
    let integrity = &written.statistics.anomalies.data_integrity;
    assert_eq!(integrity.len(), 1);
    assert_eq!(integrity[0].table, "sessions");
    assert_eq!(integrity[0].key_column, "created_by");
    assert_eq!(integrity[0].rows, 1);
    assert_eq!(integrity[0].sample_row_ids, vec![503]);
    assert!(!written.statistics.anomalies.is_empty());
    assert!(error.message.contains("sessions"), "{}", error.message);
    assert!(report.validation.is_none());
    assert_eq!(report.rollback.status, RollbackStatus::FullyRestored);
    assert!(!report.rollback.manual_intervention_required());

    // NULL and empty originals come back exactly as they were.
    assert_eq!(codes(&conn, "forms", 800).await, (None, Some(String::new())));
    assert_eq!(codes(&conn, "organization_extension", 2).await, (None, None));
    assert_eq!(codes(&conn, "user_extensions", 10).await, (None, None));
    assert_eq!(codes(&conn, "sessions", 500).await, (None, None));
    assert!(!snapshot_path.exists());
}

#[tokio::test]
async fn unmapped_organization_reference_aborts_before_any_change() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;
    seed(&conn, &["INSERT INTO forms (id, organization_id) VALUES (805, 42)"]).await;
    let settings = settings(dir.path(), standard_mapping(dir.path()));
    let snapshot_path = settings.snapshot_path.clone().unwrap();

    let report = engine(&conn, settings).run().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, "coverage_error");
    assert!(error.message.contains("forms: 42"), "{}", error.message);
    assert!(report.validation.is_none());
    assert_eq!(report.rollback.status, RollbackStatus::NotNeeded);
    assert_eq!(report.statistics.total_rows_updated(), 0);
    assert!(!snapshot_path.exists());

    for (table, id) in [
        ("organization_extension", 1),
        ("forms", 805),
        ("forms", 800),
        ("entity_types", 100),
        ("sessions", 500),
        ("report_queries", 320),
    ] {
        let row_id = if table == "organization_extension" { "organization_id" } else { "id" };
        assert_eq!(updated_at(&conn, table, row_id, id).await, UNTOUCHED_AT, "{table} {id}");
    }
    assert_eq!(codes(&conn, "forms", 805).await, (None, None));
    assert_eq!(codes(&conn, "forms", 800).await, (Some("keep".to_owned()), None));
}

#[tokio::test]
async fn partially_attributed_rows_fail_validation_and_roll_back() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed(
        &conn,
        &[
            "INSERT INTO sessions (id, created_by) VALUES (500, 10)",
            "INSERT INTO issues (id, user_id, tenant_code) VALUES (950, 777, 'acme')",
        ],
    )
    .await;

    let report = engine(&conn, settings(dir.path(), standard_mapping(dir.path())))
        .run()
        .await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.error.as_ref().unwrap().kind, "validation_failure");
    let validation = report.validation.as_ref().unwrap();
    assert!(!validation.passed);
    assert_eq!(validation.failed_tables(), vec!["issues".to_owned()]);
    let issues = validation.tables.iter().find(|t| t.table == "issues").unwrap();
    assert_eq!(issues.missing_rows, 1);
    assert_eq!(issues.partial_rows, 1);
    assert_eq!(issues.sample_row_ids, vec![950]);

    let missing = &report.statistics.anomalies.missing_mappings;
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].key_value, 777);
    assert_eq!(missing[0].reason, MissingReason::UpstreamMissing);

    assert_eq!(report.rollback.status, RollbackStatus::FullyRestored);
    assert_eq!(codes(&conn, "issues", 950).await, (Some("acme".to_owned()), None));
    assert_eq!(codes(&conn, "sessions", 500).await, (None, None));
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;
    let mapping = standard_mapping(dir.path());

    let first = engine(&conn, settings(dir.path(), mapping.clone())).run().await;
    assert!(first.succeeded());
    let stamp = updated_at(&conn, "sessions", "id", 500).await;

    let second = engine(&conn, settings(dir.path(), mapping)).run().await;

    assert!(second.succeeded());
    assert_eq!(second.statistics.total_rows_updated(), 0);
    assert!(second.statistics.anomalies.is_empty());
    assert_eq!(updated_at(&conn, "sessions", "id", 500).await, stamp);
    assert_eq!(codes(&conn, "sessions", 500).await, some("acme", "org-one"));
}

#[tokio::test]
async fn small_batches_cover_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed(
        &conn,
        &["INSERT INTO sessions (id, created_by) VALUES (1, 10), (2, 10), (3, 10), (4, 10), (5, 11)"],
    )
    .await;
    let mut settings = settings(dir.path(), standard_mapping(dir.path()));
    settings.batch_size = 2;

    let report = engine(&conn, settings).run().await;

    assert!(report.succeeded());
    assert_eq!(report.statistics.rows_updated_by_table["sessions"], 5);
    for id in 1..=4 {
        assert_eq!(codes(&conn, "sessions", id).await, some("acme", "org-one"));
    }
    assert_eq!(codes(&conn, "sessions", 5).await, some("globex", "org-two"));
}

#[tokio::test]
async fn check_reports_findings_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;
    seed(
        &conn,
        &[
            "INSERT INTO organization_extension (organization_id) VALUES (3)",
            "INSERT INTO sessions (id, created_by) VALUES (503, NULL)",
            "INSERT INTO forms (id, organization_id) VALUES (805, 42)",
            "INSERT INTO issues (id, user_id) VALUES (950, 777)",
        ],
    )
    .await;
    let settings = settings(dir.path(), standard_mapping(dir.path()));
    let report_path = settings.report_path.clone();

    let preflight = engine(&conn, settings).check().await.unwrap();

    assert!(!preflight.clean);
    assert_eq!(preflight.mapping_entries, 2);
    assert_eq!(preflight.coverage.missing, vec![3]);

    let table = |name: &str| preflight.tables.iter().find(|t| t.table == name).unwrap();
    let sessions = table("sessions");
    assert_eq!(sessions.null_keys, 1);
    assert!(sessions.null_keys_blocking);
    assert_eq!(sessions.orphaned_keys, vec![999]);
    assert!(!sessions.orphans_blocking);
    let issues = table("issues");
    assert_eq!(issues.orphaned_rows, 1);
    assert!(issues.orphans_blocking);
    assert_eq!(table("forms").unmapped_organizations, vec![42]);
    assert!(!table("entity_types").null_keys_blocking);

    assert_eq!(codes(&conn, "sessions", 500).await, (None, None));
    assert_eq!(updated_at(&conn, "sessions", "id", 500).await, UNTOUCHED_AT);
    assert!(!report_path.exists());
}

#[tokio::test]
async fn standalone_rollback_restores_persisted_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect().await;
    base_fixture(&conn).await;
    seed_all_phases(&conn).await;
    let registry = TableRegistry::mentoring().unwrap();
    let saved = dir.path().join("saved-snapshot.json");
    Snapshot::capture(&conn, &registry)
        .await
        .unwrap()
        .write_to(&saved)
        .await
        .unwrap();

    let report = engine(&conn, settings(dir.path(), standard_mapping(dir.path())))
        .run()
        .await;
    assert!(report.succeeded());
    assert_eq!(codes(&conn, "sessions", 500).await, some("acme", "org-one"));

    let snapshot = Snapshot::read_from(&saved).await.unwrap();
    let progress = MutationProgress::from_snapshot(&snapshot, &registry);
    let coordinator = RollbackCoordinator::for_connection(conn.clone(), 2).unwrap();
    let mut stats = RunStatistics::default();

    let rollback = coordinator.rollback(&snapshot, &progress, &mut stats).await;

    assert_eq!(rollback.status, RollbackStatus::FullyRestored);
    assert!(rollback.data.failed_tables.is_empty());
    assert!(rollback.data.restored_tables.contains(&"sessions".to_owned()));
    assert_eq!(codes(&conn, "sessions", 500).await, (None, None));
    assert_eq!(codes(&conn, "forms", 800).await, (Some("keep".to_owned()), None));
    assert_eq!(codes(&conn, "forms", 801).await, (Some(String::new()), Some(String::new())));
    assert_eq!(codes(&conn, "forms", 802).await, some("x", "y"));
}

#[tokio::test]
async fn failed_chunk_rolls_back_and_releases_the_connection() {
    let conn = connect().await;
    exec(
        &conn,
        "CREATE TABLE forms (id INTEGER PRIMARY KEY, organization_id INTEGER, tenant_code TEXT, organization_code TEXT)",
    )
    .await;
    seed(&conn, &["INSERT INTO forms (id, organization_id) VALUES (800, 1)"]).await;
    let registry = TableRegistry::mentoring().unwrap();
    let forms = registry.get("forms").unwrap();
    let mapping: OrganizationMapping = [(1, TenantIdentity::new("acme", "org-one"))].into_iter().collect();
    let executor = ResolutionExecutor::new(conn.clone(), TenantIdentity::new("default", "default_code"), 100);
    let mut stats = RunStatistics::default();

    let err = executor
        .resolve_table(&registry, forms, &mapping, &mut stats)
        .await
        .unwrap_err();

    assert!(matches!(err, BackfillError::Db(_)), "{err}");
    assert_eq!(err.kind(), "database_error");
    assert_eq!(codes(&conn, "forms", 800).await, (None, None));

    // The single pooled connection must be free of the failed transaction.
    exec(&conn, "ALTER TABLE forms ADD COLUMN updated_at TEXT").await;
    let rows = executor
        .resolve_table(&registry, forms, &mapping, &mut stats)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(codes(&conn, "forms", 800).await, some("acme", "org-one"));
}
