//! PostgreSQL transactor and transaction handle.
//!
//! Each handle pins one pooled connection on which
//! `BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED, READ WRITE` has been
//! issued. Commit and rollback take the connection out of the handle, so the
//! first finalize releases it and any later call is refused.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use async_trait::async_trait;
use diesel::QueryResult;
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, TransactionManager};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::ports::{Finalize, Transaction, TransactionError, Transactor, finalize_attached};
use crate::domain::{Context, ContextKey};

use super::error_mapping::{PgExecutorError, diesel_error_message, map_diesel_error};
use super::executor::PgExecutor;
use super::pool::{DbPool, OwnedConnection};

/// SQL used to open every relational unit of work.
pub const BEGIN_SQL: &str = "BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED, READ WRITE";

static POSTGRES_KEY: LazyLock<ContextKey> = LazyLock::new(|| ContextKey::new("postgres"));

/// Transactor for a PostgreSQL database reached through a [`DbPool`].
#[derive(Clone, Debug)]
pub struct PgTransactor {
    pool: DbPool,
    key: ContextKey,
}

impl PgTransactor {
    /// Transactor storing its handles under [`PgTransactor::family_key`].
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self::with_key(pool, Self::family_key())
    }

    /// Transactor storing its handles under a caller-supplied key.
    ///
    /// Needed when two PostgreSQL databases take part in the same composite.
    #[must_use]
    pub const fn with_key(pool: DbPool, key: ContextKey) -> Self {
        Self { pool, key }
    }

    /// Process-wide key shared by PostgreSQL transactors built with
    /// [`PgTransactor::new`].
    #[must_use]
    pub fn family_key() -> ContextKey {
        *POSTGRES_KEY
    }

    /// Key this transactor stores its handles under.
    #[must_use]
    pub const fn key(&self) -> ContextKey {
        self.key
    }

    /// Client that writes through this transactor's handles.
    #[must_use]
    pub fn executor(&self) -> PgExecutor {
        PgExecutor::new(self.pool.clone(), self.key)
    }

    fn begin_error(&self, message: impl Into<String>) -> TransactionError {
        TransactionError::begin(self.name(), message)
    }
}

#[async_trait]
impl Transactor for PgTransactor {
    fn name(&self) -> &str {
        self.key.name()
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>, TransactionError> {
        if let Some(reason) = ctx.err() {
            return Err(self.begin_error(reason.to_string()));
        }

        let mut connection = self
            .pool
            .get_owned()
            .await
            .map_err(|err| self.begin_error(err.message()))?;
        AnsiTransactionManager::begin_transaction_sql(&mut *connection, BEGIN_SQL)
            .await
            .map_err(|err| self.begin_error(diesel_error_message(&err, "begin")))?;

        debug!(backend = self.name(), "postgres transaction opened");
        let transaction: Arc<dyn Transaction> =
            PgTransaction::open(connection, ctx.clone(), self.key);
        Ok(transaction)
    }

    async fn commit_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
        finalize_attached(ctx, &self.key, self.name(), Finalize::Commit).await
    }

    async fn rollback_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
        finalize_attached(ctx, &self.key, self.name(), Finalize::Rollback).await
    }
}

/// An open PostgreSQL transaction pinned to one pooled connection.
pub struct PgTransaction {
    this: Weak<Self>,
    origin: Context,
    key: ContextKey,
    connection: Mutex<Option<OwnedConnection>>,
    finalized: AtomicBool,
}

impl PgTransaction {
    fn open(connection: OwnedConnection, origin: Context, key: ContextKey) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            origin,
            key,
            connection: Mutex::new(Some(connection)),
            finalized: AtomicBool::new(false),
        })
    }

    async fn take_connection(&self) -> Result<OwnedConnection, TransactionError> {
        let mut slot = self.connection.lock().await;
        self.finalized.store(true, Ordering::Release);
        slot.take()
            .ok_or_else(|| TransactionError::already_finalized(self.backend()))
    }

    /// Run `operation` on the pinned connection.
    pub(crate) async fn run<'a, T, F>(&self, operation: F) -> Result<T, PgExecutorError>
    where
        F: for<'r> FnOnce(&'r mut AsyncPgConnection) -> ScopedBoxFuture<'a, 'r, QueryResult<T>>
            + Send
            + 'a,
        T: Send + 'a,
    {
        let mut slot = self.connection.lock().await;
        let Some(connection) = slot.as_mut() else {
            return Err(TransactionError::closed(self.backend()).into());
        };
        operation(&mut **connection).await.map_err(map_diesel_error)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn backend(&self) -> &str {
        self.key.name()
    }

    async fn commit(&self) -> Result<(), TransactionError> {
        let mut connection = self.take_connection().await?;
        AnsiTransactionManager::commit_transaction(&mut *connection)
            .await
            .map_err(|err| {
                warn!(backend = self.backend(), error = %err, "postgres commit failed");
                TransactionError::commit(self.backend(), diesel_error_message(&err, "commit"))
            })?;
        debug!(backend = self.backend(), "postgres transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransactionError> {
        let mut connection = self.take_connection().await?;
        AnsiTransactionManager::rollback_transaction(&mut *connection)
            .await
            .map_err(|err| {
                warn!(backend = self.backend(), error = %err, "postgres rollback failed");
                TransactionError::rollback(self.backend(), diesel_error_message(&err, "rollback"))
            })?;
        debug!(backend = self.backend(), "postgres transaction rolled back");
        Ok(())
    }

    fn context(&self) -> Context {
        match self.this.upgrade() {
            Some(this) => self.origin.with_transaction(self.key, this),
            None => self.origin.clone(),
        }
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.is_finalized() {
            // The pool discards the connection because it is still mid-transaction.
            warn!(
                backend = self.key.name(),
                "postgres transaction dropped without commit or rollback"
            );
        }
    }
}
