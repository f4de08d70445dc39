#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Common utilities for the `SQLite` integration tests.

use backfill_db::{ConnectOpts, DbHandle};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tenant_backfill::{BackfillEngine, BackfillSettings, TableRegistry, TargetColumn, TenantIdentity};

pub const UNTOUCHED_AT: &str = "2000-01-01 00:00:00";

pub async fn connect() -> DatabaseConnection {
    DbHandle::connect("sqlite::memory:", ConnectOpts::single())
        .await
        .expect("sqlite connection")
        .sea()
}

/// One table per registry entry: row id, join key, target columns, `updated_at`.
/// `entities.entity_type_id` carries a real foreign key.
pub async fn create_schema(conn: &DatabaseConnection, registry: &TableRegistry) {
    for table in registry.tables() {
        let mut columns = vec![format!("{} INTEGER PRIMARY KEY", table.row_id)];
        if let Some(key) = table.join_key.filter(|k| *k != table.row_id) {
            if table.name == "entities" {
                columns.push(format!("{key} INTEGER REFERENCES entity_types(id)"));
            } else {
                columns.push(format!("{key} INTEGER"));
            }
        }
        for target in table.targets {
            columns.push(format!("{} TEXT", target.column()));
        }
        columns.push(format!("updated_at TEXT NOT NULL DEFAULT '{UNTOUCHED_AT}'"));
        exec(
            conn,
            &format!("CREATE TABLE {} ({})", table.name, columns.join(", ")),
        )
        .await;
    }
}

pub async fn exec(conn: &DatabaseConnection, sql: &str) {
    conn.execute(Statement::from_string(DbBackend::Sqlite, sql))
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"));
}

pub async fn seed(conn: &DatabaseConnection, statements: &[&str]) {
    for sql in statements {
        exec(conn, sql).await;
    }
}

/// `(tenant_code, organization_code)` of one row; `organization_code` is
/// `None` for tenant-only tables.
pub async fn codes(
    conn: &DatabaseConnection,
    table: &str,
    id: i64,
) -> (Option<String>, Option<String>) {
    let registry = TableRegistry::mentoring().unwrap();
    let descriptor = registry.get(table).unwrap();
    let org = if descriptor.targets_column(TargetColumn::OrganizationCode) {
        "organization_code"
    } else {
        "NULL AS organization_code"
    };
    let sql = format!(
        "SELECT tenant_code, {org} FROM {table} WHERE {} = {id}",
        descriptor.row_id
    );
    let row = conn
        .query_one(Statement::from_string(DbBackend::Sqlite, sql))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{table} row {id} not found"));
    (
        row.try_get("", "tenant_code").unwrap(),
        row.try_get("", "organization_code").unwrap(),
    )
}

pub async fn updated_at(conn: &DatabaseConnection, table: &str, row_id_column: &str, id: i64) -> String {
    let sql = format!("SELECT updated_at FROM {table} WHERE {row_id_column} = {id}");
    conn.query_one(Statement::from_string(DbBackend::Sqlite, sql))
        .await
        .unwrap()
        .unwrap()
        .try_get("", "updated_at")
        .unwrap()
}

pub fn some(tenant: &str, org: &str) -> (Option<String>, Option<String>) {
    (Some(tenant.to_owned()), Some(org.to_owned()))
}

pub fn write_mapping(dir: &Path, rows: &[(i64, &str, &str)]) -> PathBuf {
    let mut body = String::from("organization_id,organization_code,tenant_code\n");
    for (id, org, tenant) in rows {
        writeln!(body, "{id},{org},{tenant}").unwrap();
    }
    let path = dir.join("mapping.csv");
    std::fs::write(&path, body).unwrap();
    path
}

pub fn settings(dir: &Path, mapping_file: PathBuf) -> BackfillSettings {
    BackfillSettings {
        defaults: TenantIdentity::new("default", "default_code"),
        mapping_file,
        delimiter: b',',
        batch_size: 1000,
        filter_to_source_of_truth: true,
        report_path: dir.join("report.json"),
        snapshot_path: Some(dir.join("snapshot.json")),
    }
}

pub fn engine(conn: &DatabaseConnection, settings: BackfillSettings) -> BackfillEngine {
    BackfillEngine::for_connection(conn.clone(), TableRegistry::mentoring().unwrap(), settings)
        .unwrap()
}

/// Schema plus two mapped organizations (1 and 2) with one user each.
pub async fn base_fixture(conn: &DatabaseConnection) {
    create_schema(conn, &TableRegistry::mentoring().unwrap()).await;
    seed(
        conn,
        &[
            "INSERT INTO organization_extension (organization_id) VALUES (1), (2)",
            "INSERT INTO user_extensions (user_id, organization_id) VALUES (10, 1), (11, 2)",
        ],
    )
    .await;
}

pub fn standard_mapping(dir: &Path) -> PathBuf {
    write_mapping(dir, &[(1, "org-one", "acme"), (2, "org-two", "globex")])
}
