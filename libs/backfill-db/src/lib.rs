//! Connection handle used by the tenant backfill.
//!
//! A [`DbHandle`] owns exactly one `SQLx` pool and the `SeaORM` connection
//! that shares it. `PostgreSQL` is the production target (optionally with
//! Citus); `SQLite` backs the test suites and local rehearsals.
//!
//! Backends are gated by the `pg` and `sqlite` features, both on by default.
//!
//! ```rust,no_run
//! use backfill_db::{ConnectOpts, DbHandle};
//!
//! # async fn example() -> backfill_db::Result<()> {
//! let db = DbHandle::connect("sqlite::memory:", ConnectOpts::single()).await?;
//! let conn = db.sea();
//! # drop(conn);
//! db.close().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(
    not(any(feature = "pg", feature = "sqlite")),
    allow(unused_imports, unused_variables, dead_code, unreachable_code)
)]

pub mod options;
mod pool_opts;

pub use options::{DbConnConfig, expand_env_vars, redact_credentials_in_dsn};

use std::str::FromStr;
use std::time::Duration;

#[cfg(any(feature = "pg", feature = "sqlite"))]
use pool_opts::ApplyPoolOpts;

#[cfg(feature = "pg")]
use sea_orm::sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
#[cfg(feature = "sqlite")]
use sea_orm::sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use sea_orm::DatabaseConnection;
#[cfg(feature = "pg")]
use sea_orm::SqlxPostgresConnector;
#[cfg(feature = "sqlite")]
use sea_orm::SqlxSqliteConnector;

use thiserror::Error;

/// `application_name` reported to `PostgreSQL`, visible in `pg_stat_activity`.
pub const APPLICATION_NAME: &str = "tenant-backfill";

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unsupported DSN scheme: {0}")]
    UnknownDsn(String),

    #[error("{0} support is not compiled in")]
    EngineDisabled(&'static str),

    #[error("invalid database configuration: {0}")]
    InvalidConfig(String),

    #[error("environment variable '{name}' referenced by the DSN is not set")]
    EnvVar {
        name: String,
        #[source]
        source: std::env::VarError,
    },

    #[cfg(any(feature = "pg", feature = "sqlite"))]
    #[error(transparent)]
    Sqlx(#[from] sea_orm::sqlx::Error),

    #[error(transparent)]
    Sea(#[from] sea_orm::DbErr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbEngine {
    Postgres,
    Sqlite,
}

impl DbEngine {
    /// Detect the engine from the DSN scheme; the rest of the DSN is not inspected.
    ///
    /// # Errors
    /// Returns `DbError::UnknownDsn` (with credentials redacted) for any other scheme.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let scheme = dsn.trim_start();
        if scheme.starts_with("postgres://") || scheme.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if scheme.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(DbError::UnknownDsn(redact_credentials_in_dsn(Some(dsn))))
        }
    }
}

/// Pool sizing and timeouts, applied to whichever pool builder is in use.
#[derive(Clone, Debug)]
pub struct ConnectOpts {
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    pub acquire_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub test_before_acquire: bool,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            max_conns: Some(4),
            min_conns: None,
            acquire_timeout: Some(Duration::from_secs(30)),
            idle_timeout: None,
            test_before_acquire: false,
        }
    }
}

impl ConnectOpts {
    /// One pooled connection. Required for `sqlite::memory:`, where every
    /// connection would otherwise see its own empty database.
    #[must_use]
    pub fn single() -> Self {
        Self {
            max_conns: Some(1),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
enum DbPool {
    #[cfg(feature = "pg")]
    Postgres(PgPool),
    #[cfg(feature = "sqlite")]
    Sqlite(SqlitePool),
}

#[derive(Debug, Clone)]
pub struct DbHandle {
    engine: DbEngine,
    pool: DbPool,
    sea: DatabaseConnection,
}

impl DbHandle {
    /// Shorthand for [`DbEngine::from_dsn`].
    ///
    /// # Errors
    /// Returns `DbError::UnknownDsn` for an unsupported scheme.
    pub fn detect(dsn: &str) -> Result<DbEngine> {
        DbEngine::from_dsn(dsn)
    }

    /// Open a pool for `dsn`.
    ///
    /// `SQLite` connections always enforce foreign keys so constraint discovery
    /// reflects what the schema declares.
    ///
    /// # Errors
    /// Fails on an unsupported or malformed DSN, a backend that is not
    /// compiled in, or when the first connection cannot be established.
    pub async fn connect(dsn: &str, opts: ConnectOpts) -> Result<Self> {
        let engine = DbEngine::from_dsn(dsn)?;
        tracing::debug!(
            dsn = %redact_credentials_in_dsn(Some(dsn)),
            ?engine,
            "Opening database pool"
        );
        match engine {
            DbEngine::Postgres => Self::connect_pg(dsn, &opts).await,
            DbEngine::Sqlite => Self::connect_sqlite(dsn, &opts).await,
        }
    }

    #[cfg(feature = "pg")]
    async fn connect_pg(dsn: &str, opts: &ConnectOpts) -> Result<Self> {
        let options = PgConnectOptions::from_str(dsn)?.application_name(APPLICATION_NAME);
        let pool = PgPoolOptions::new().apply(opts).connect_with(options).await?;
        Ok(Self {
            engine: DbEngine::Postgres,
            sea: SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone()),
            pool: DbPool::Postgres(pool),
        })
    }

    #[cfg(not(feature = "pg"))]
    #[allow(clippy::unused_async)]
    async fn connect_pg(_dsn: &str, _opts: &ConnectOpts) -> Result<Self> {
        Err(DbError::EngineDisabled("PostgreSQL"))
    }

    #[cfg(feature = "sqlite")]
    async fn connect_sqlite(dsn: &str, opts: &ConnectOpts) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new().apply(opts).connect_with(options).await?;
        Ok(Self {
            engine: DbEngine::Sqlite,
            sea: SqlxSqliteConnector::from_sqlx_sqlite_pool(pool.clone()),
            pool: DbPool::Sqlite(pool),
        })
    }

    #[cfg(not(feature = "sqlite"))]
    #[allow(clippy::unused_async)]
    async fn connect_sqlite(_dsn: &str, _opts: &ConnectOpts) -> Result<Self> {
        Err(DbError::EngineDisabled("SQLite"))
    }

    /// Connect from the `database:` configuration section, expanding `${VAR}`
    /// placeholders in the DSN first.
    ///
    /// # Errors
    /// See [`DbConnConfig::resolved_dsn`] and [`Self::connect`].
    pub async fn from_config(cfg: &DbConnConfig) -> Result<Self> {
        let dsn = cfg.resolved_dsn()?;
        Self::connect(&dsn, cfg.connect_opts()).await
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(self) {
        match self.pool {
            #[cfg(feature = "pg")]
            DbPool::Postgres(pool) => pool.close().await,
            #[cfg(feature = "sqlite")]
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }

    #[must_use]
    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    /// `SeaORM` connection sharing this handle's pool.
    #[must_use]
    pub fn sea(&self) -> DatabaseConnection {
        self.sea.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_follows_scheme() {
        assert_eq!(DbEngine::from_dsn("sqlite::memory:").unwrap(), DbEngine::Sqlite);
        assert_eq!(
            DbEngine::from_dsn("sqlite:///var/lib/mentoring.db?mode=rwc").unwrap(),
            DbEngine::Sqlite
        );
        assert_eq!(
            DbHandle::detect("postgres://backfill@localhost/mentoring").unwrap(),
            DbEngine::Postgres
        );
        assert_eq!(
            DbHandle::detect("  postgresql://localhost/mentoring").unwrap(),
            DbEngine::Postgres
        );
        assert!(DbHandle::detect("mysql://localhost/mentoring").is_err());
    }

    #[test]
    fn rejected_dsn_is_redacted() {
        let err = DbHandle::detect("oracle://scott:tiger@db/orcl").unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("tiger"), "{msg}");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_pool_enforces_foreign_keys() -> anyhow::Result<()> {
        use sea_orm::{ConnectionTrait, Statement};

        let db = DbHandle::connect("sqlite::memory:", ConnectOpts::single()).await?;
        assert_eq!(db.engine(), DbEngine::Sqlite);

        let conn = db.sea();
        let backend = conn.get_database_backend();
        let row = conn
            .query_one(Statement::from_string(backend, "PRAGMA foreign_keys"))
            .await?
            .expect("pragma row");
        assert_eq!(row.try_get_by_index::<i64>(0)?, 1);

        conn.execute(Statement::from_string(
            backend,
            "CREATE TABLE organization_extension (organization_id INTEGER PRIMARY KEY)",
        ))
        .await?;
        conn.execute(Statement::from_string(
            backend,
            "CREATE TABLE user_extensions (user_id INTEGER PRIMARY KEY, \
             organization_id INTEGER REFERENCES organization_extension(organization_id))",
        ))
        .await?;
        let orphan = conn
            .execute(Statement::from_string(
                backend,
                "INSERT INTO user_extensions (user_id, organization_id) VALUES (1, 99)",
            ))
            .await;
        assert!(orphan.is_err());

        db.close().await;
        Ok(())
    }
}
