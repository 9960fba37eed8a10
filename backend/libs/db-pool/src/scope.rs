//! Explicit transaction scope passed to repository calls.

use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::ops::{Deref, DerefMut};

/// Live PostgreSQL transaction handle.
pub type PgTx = Transaction<'static, Postgres>;

/// Where a repository call runs.
///
/// Repositories stay transaction-agnostic: they receive the scope from the
/// caller instead of looking one up, and fall back to an autocommit pooled
/// connection for [`Scope::Ambient`].
#[derive(Debug)]
pub enum Scope<'s, Tx> {
    /// Autocommit on the shared pool.
    Ambient,
    /// Inside a transaction opened by the coordinator.
    Transaction(&'s mut Tx),
}

impl<'s, Tx> Scope<'s, Tx> {
    /// Borrow the scope again for the next repository call.
    pub fn reborrow(&mut self) -> Scope<'_, Tx> {
        match self {
            Scope::Ambient => Scope::Ambient,
            Scope::Transaction(tx) => Scope::Transaction(&mut **tx),
        }
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, Scope::Transaction(_))
    }
}

impl<Tx> Default for Scope<'_, Tx> {
    fn default() -> Self {
        Scope::Ambient
    }
}

pub type PgScope<'s> = Scope<'s, PgTx>;

/// Connection resolved from a [`PgScope`].
pub enum PgConn<'s> {
    Pooled(PoolConnection<Postgres>),
    Borrowed(&'s mut PgConnection),
}

impl Deref for PgConn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            PgConn::Pooled(conn) => conn,
            PgConn::Borrowed(conn) => conn,
        }
    }
}

impl DerefMut for PgConn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            PgConn::Pooled(conn) => conn,
            PgConn::Borrowed(conn) => conn,
        }
    }
}

/// Resolve a scope into a connection: the open transaction when there is one,
/// a pooled autocommit connection otherwise.
///
/// ```rust,no_run
/// # use db_pool::{connection, PgScope};
/// # async fn example(pool: sqlx::PgPool, scope: PgScope<'_>) -> Result<(), sqlx::Error> {
/// let mut conn = connection(&pool, scope).await?;
/// sqlx::query("SELECT 1").execute(&mut *conn).await?;
/// # Ok(())
/// # }
/// ```
pub async fn connection<'s>(pool: &PgPool, scope: PgScope<'s>) -> Result<PgConn<'s>, sqlx::Error> {
    match scope {
        Scope::Ambient => Ok(PgConn::Pooled(pool.acquire().await?)),
        Scope::Transaction(tx) => Ok(PgConn::Borrowed(&mut **tx)),
    }
}
