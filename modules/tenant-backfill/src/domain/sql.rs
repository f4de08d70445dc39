//! Statement builders shared by the executor, snapshot and validator.
//!
//! Identifiers come from the validated [`TableRegistry`](super::registry::TableRegistry)
//! and values are always bound. "Missing" means NULL or the empty string.

use super::registry::{TargetColumn, UPDATED_AT};
use sea_orm::sea_query::{
    Alias, Cond, Expr, Func, Order, Query, SelectStatement, SimpleExpr, UpdateStatement,
};
use sea_orm::{ConnectionTrait, DbErr, QueryResult, Statement, StatementBuilder};

/// Upper bound on sample row ids carried in reports and errors.
pub const SAMPLE_LIMIT: u64 = 25;

pub(crate) const KEY_VALUE: &str = "key_value";
pub(crate) const ROW_COUNT: &str = "row_count";
pub(crate) const ROW_ID: &str = "row_id";

pub(crate) fn col(name: &str) -> Expr {
    Expr::col(Alias::new(name))
}

/// Double-quoted identifier for the few raw statements that cannot be built.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CAST(col AS BIGINT)`; integer columns of any width decode as `i64`.
pub(crate) fn as_bigint(name: &str) -> SimpleExpr {
    Expr::cust(format!("CAST({} AS BIGINT)", quote_ident(name)))
}

pub(crate) fn missing(column: &str) -> Cond {
    Cond::any()
        .add(col(column).is_null())
        .add(col(column).eq(""))
}

pub(crate) fn present(column: &str) -> Cond {
    Cond::all()
        .add(col(column).is_not_null())
        .add(col(column).ne(""))
}

pub(crate) fn any_missing(targets: &[TargetColumn]) -> Cond {
    targets
        .iter()
        .fold(Cond::any(), |cond, t| cond.add(missing(t.column())))
}

/// `COALESCE(NULLIF(col, ''), value)`: never overwrites a present value.
pub(crate) fn fill_missing(column: &str, value: &str) -> SimpleExpr {
    let current: SimpleExpr = Func::cust(Alias::new("NULLIF"))
        .arg(col(column))
        .arg("")
        .into();
    Func::coalesce([current, Expr::val(value).into()]).into()
}

/// Rows still missing a target, grouped by join key, with counts.
pub(crate) fn missing_rows_by_key(
    table: &str,
    key: &str,
    targets: &[TargetColumn],
    extra: Cond,
) -> SelectStatement {
    Query::select()
        .expr_as(as_bigint(key), Alias::new(KEY_VALUE))
        .expr_as(Expr::cust("COUNT(*)"), Alias::new(ROW_COUNT))
        .from(Alias::new(table))
        .cond_where(Cond::all().add(any_missing(targets)).add(extra))
        .group_by_col(Alias::new(key))
        .order_by(Alias::new(key), Order::Asc)
        .to_owned()
}

pub(crate) fn count_where(table: &str, filter: Cond) -> SelectStatement {
    Query::select()
        .expr_as(Expr::cust("COUNT(*)"), Alias::new(ROW_COUNT))
        .from(Alias::new(table))
        .cond_where(filter)
        .to_owned()
}

pub(crate) fn sample_row_ids(table: &str, row_id: &str, filter: Cond) -> SelectStatement {
    Query::select()
        .expr_as(as_bigint(row_id), Alias::new(ROW_ID))
        .from(Alias::new(table))
        .cond_where(filter)
        .order_by(Alias::new(row_id), Order::Asc)
        .limit(SAMPLE_LIMIT)
        .to_owned()
}

/// One bounded chunk of the fill-missing update.
///
/// ```sql
/// UPDATE t SET tenant_code = COALESCE(NULLIF(tenant_code, ''), $1), ..., updated_at = CURRENT_TIMESTAMP
/// WHERE row_id IN (SELECT row_id FROM t WHERE <filter> AND <any target missing> LIMIT $n)
/// ```
pub(crate) fn fill_chunk(
    table: &str,
    row_id: &str,
    assignments: &[(TargetColumn, &str)],
    filter: Cond,
    batch_size: u64,
) -> UpdateStatement {
    let targets: Vec<TargetColumn> = assignments.iter().map(|(t, _)| *t).collect();
    let chunk = Query::select()
        .column(Alias::new(row_id))
        .from(Alias::new(table))
        .cond_where(Cond::all().add(filter).add(any_missing(&targets)))
        .limit(batch_size)
        .to_owned();

    let mut update = Query::update();
    update.table(Alias::new(table));
    for (target, value) in assignments {
        update.value(Alias::new(target.column()), fill_missing(target.column(), value));
    }
    update
        .value(Alias::new(UPDATED_AT), Expr::current_timestamp())
        .and_where(col(row_id).in_subquery(chunk))
        .to_owned()
}

pub(crate) fn build<C, S>(conn: &C, stmt: &S) -> Statement
where
    C: ConnectionTrait,
    S: StatementBuilder,
{
    conn.get_database_backend().build(stmt)
}

pub(crate) async fn count<C: ConnectionTrait>(conn: &C, stmt: &SelectStatement) -> Result<u64, DbErr> {
    let row = conn.query_one(build(conn, stmt)).await?;
    let n = match row {
        Some(row) => row.try_get::<i64>("", ROW_COUNT)?,
        None => 0,
    };
    Ok(u64::try_from(n).unwrap_or_default())
}

pub(crate) async fn row_ids<C: ConnectionTrait>(conn: &C, stmt: &SelectStatement) -> Result<Vec<i64>, DbErr> {
    conn.query_all(build(conn, stmt))
        .await?
        .iter()
        .map(|row| row.try_get::<i64>("", ROW_ID))
        .collect()
}

/// `(key, row count)` pairs from [`missing_rows_by_key`].
pub(crate) fn key_counts(rows: &[QueryResult]) -> Result<Vec<(i64, u64)>, DbErr> {
    rows.iter()
        .map(|row| {
            let key = row.try_get::<i64>("", KEY_VALUE)?;
            let n = row.try_get::<i64>("", ROW_COUNT)?;
            Ok((key, u64::try_from(n).unwrap_or_default()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::DatabaseBackend;

    #[test]
    fn fill_chunk_never_overwrites_present_values() {
        let stmt = fill_chunk(
            "sessions",
            "id",
            &[(TargetColumn::TenantCode, "acme")],
            Cond::all().add(col("created_by").eq(7_i64)),
            500,
        );
        let sql = DatabaseBackend::Postgres.build(&stmt).to_string();
        assert!(
            sql.contains(r#""tenant_code" = COALESCE(NULLIF("tenant_code", ''), 'acme')"#),
            "{sql}"
        );
        assert!(sql.contains("CURRENT_TIMESTAMP"), "{sql}");
        assert!(sql.contains("LIMIT 500"), "{sql}");
        assert!(sql.contains(r#""tenant_code" IS NULL OR "tenant_code" = ''"#), "{sql}");
    }

    #[test]
    fn grouped_keys_cast_to_bigint() {
        let stmt = missing_rows_by_key(
            "forms",
            "organization_id",
            &[TargetColumn::TenantCode, TargetColumn::OrganizationCode],
            Cond::all().add(col("organization_id").is_not_null()),
        );
        let sql = DatabaseBackend::Sqlite.build(&stmt).to_string();
        assert!(sql.contains(r#"CAST("organization_id" AS BIGINT)"#), "{sql}");
        assert!(sql.contains(r#"GROUP BY "organization_id""#), "{sql}");
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
