//! Transaction coordinator
//!
//! Runs a unit of work inside one database transaction with a chosen isolation
//! level. The callback receives an explicit [`Scope`] capability that it
//! forwards to every repository call belonging to the unit of work:
//!
//! ```rust,no_run
//! use db_pool::{PgTransactionManager, TransactionCoordinator};
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), sqlx::Error> {
//! let coordinator = TransactionCoordinator::new(PgTransactionManager::new(pool.clone()));
//!
//! let inserted: u64 = coordinator
//!     .with_serializable(move |mut scope| {
//!         let pool = pool.clone();
//!         Box::pin(async move {
//!             let mut conn = db_pool::connection(&pool, scope.reborrow()).await?;
//!             let done = sqlx::query("INSERT INTO audit (note) VALUES ('hello')")
//!                 .execute(&mut *conn)
//!                 .await?;
//!             Ok::<_, sqlx::Error>(done.rows_affected())
//!         })
//!     })
//!     .await?;
//! # let _ = inserted;
//! # Ok(())
//! # }
//! ```
//!
//! * `Err` from the callback rolls back and is returned unchanged. A failing
//!   rollback is logged and never replaces the original error.
//! * `Ok` commits.
//! * A panic rolls back and is then resumed on the caller.

use crate::scope::{PgTx, Scope};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::PgPool;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Isolation level and access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            read_only: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            read_only: true,
        }
    }

    /// `SET TRANSACTION` statement applying these options.
    pub fn to_sql(&self) -> String {
        let mode = if self.read_only { "READ ONLY" } else { "READ WRITE" };
        format!(
            "SET TRANSACTION ISOLATION LEVEL {}, {}",
            self.isolation.as_sql(),
            mode
        )
    }
}

/// Backend that opens and finishes transactions.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Handle threaded through [`Scope::Transaction`].
    type Tx: Send + 'static;

    async fn begin(&self, options: TxOptions) -> Result<Self::Tx, sqlx::Error>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), sqlx::Error>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), sqlx::Error>;
}

/// PostgreSQL transactions on a shared pool.
#[derive(Clone)]
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    type Tx = PgTx;

    async fn begin(&self, options: TxOptions) -> Result<PgTx, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // Must be the first statement of the transaction
        sqlx::query(&options.to_sql()).execute(&mut *tx).await?;
        Ok(tx)
    }

    async fn commit(&self, tx: PgTx) -> Result<(), sqlx::Error> {
        tx.commit().await
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), sqlx::Error> {
        tx.rollback().await
    }
}

/// Runs callbacks inside transactions opened by a [`TransactionManager`].
pub struct TransactionCoordinator<M> {
    manager: Arc<M>,
    span: Span,
}

impl<M> Clone for TransactionCoordinator<M> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            span: self.span.clone(),
        }
    }
}

impl<M: TransactionManager> TransactionCoordinator<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager: Arc::new(manager),
            span: tracing::info_span!("tx_coordinator"),
        }
    }

    /// Parent span for this coordinator's log events.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Read-committed, read-write.
    pub async fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        self.with_transaction_options(TxOptions::default(), f).await
    }

    pub async fn with_isolation<F, T, E>(&self, isolation: IsolationLevel, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        self.with_transaction_options(TxOptions::with_isolation(isolation), f)
            .await
    }

    pub async fn with_read_only<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        self.with_transaction_options(TxOptions::read_only(), f).await
    }

    pub async fn with_serializable<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        self.with_isolation(IsolationLevel::Serializable, f).await
    }

    pub async fn with_repeatable_read<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        self.with_isolation(IsolationLevel::RepeatableRead, f).await
    }

    pub async fn with_read_uncommitted<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        self.with_isolation(IsolationLevel::ReadUncommitted, f).await
    }

    pub async fn with_transaction_options<F, T, E>(&self, options: TxOptions, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(Scope<'t, M::Tx>) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        let mut tx = self.manager.begin(options).await.map_err(|e| {
            error!(parent: &self.span, error = %e, isolation = %options.isolation, "Failed to begin transaction");
            E::from(e)
        })?;
        debug!(parent: &self.span, isolation = %options.isolation, read_only = options.read_only, "Transaction started");

        let outcome = AssertUnwindSafe(f(Scope::Transaction(&mut tx)))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                self.manager.commit(tx).await.map_err(|e| {
                    error!(parent: &self.span, error = %e, "Failed to commit transaction");
                    E::from(e)
                })?;
                debug!(parent: &self.span, "Transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = self.manager.rollback(tx).await {
                    warn!(parent: &self.span, error = %rollback_err, "Rollback failed after unit of work error");
                } else {
                    debug!(parent: &self.span, "Transaction rolled back");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(rollback_err) = self.manager.rollback(tx).await {
                    error!(parent: &self.span, error = %rollback_err, "Rollback failed after panic in unit of work");
                } else {
                    warn!(parent: &self.span, "Transaction rolled back after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}
