//! [`ConnectOpts`] applied to the `SQLx` pool builders.

use crate::ConnectOpts;

pub trait ApplyPoolOpts: Sized {
    #[must_use]
    fn apply(self, opts: &ConnectOpts) -> Self;
}

#[cfg(feature = "pg")]
impl ApplyPoolOpts for sea_orm::sqlx::postgres::PgPoolOptions {
    fn apply(self, opts: &ConnectOpts) -> Self {
        let builder = self.test_before_acquire(opts.test_before_acquire);
        let builder = match opts.max_conns {
            Some(n) => builder.max_connections(n),
            None => builder,
        };
        let builder = match opts.min_conns {
            Some(n) => builder.min_connections(n),
            None => builder,
        };
        let builder = match opts.acquire_timeout {
            Some(t) => builder.acquire_timeout(t),
            None => builder,
        };
        match opts.idle_timeout {
            Some(t) => builder.idle_timeout(t),
            None => builder,
        }
    }
}

#[cfg(feature = "sqlite")]
impl ApplyPoolOpts for sea_orm::sqlx::sqlite::SqlitePoolOptions {
    fn apply(self, opts: &ConnectOpts) -> Self {
        let builder = self.test_before_acquire(opts.test_before_acquire);
        let builder = match opts.max_conns {
            Some(n) => builder.max_connections(n),
            None => builder,
        };
        let builder = match opts.min_conns {
            Some(n) => builder.min_connections(n),
            None => builder,
        };
        let builder = match opts.acquire_timeout {
            Some(t) => builder.acquire_timeout(t),
            None => builder,
        };
        match opts.idle_timeout {
            Some(t) => builder.idle_timeout(t),
            None => builder,
        }
    }
}
