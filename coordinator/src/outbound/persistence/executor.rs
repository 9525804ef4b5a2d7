//! Context-aware query executor for the relational adapter.

use diesel::QueryResult;
use diesel_async::AsyncPgConnection;
use diesel_async::scoped_futures::ScopedBoxFuture;

use crate::domain::ports::TransactionError;
use crate::domain::{Context, ContextKey};

use super::error_mapping::{PgExecutorError, map_diesel_error, map_pool_error};
use super::pg_transaction::PgTransaction;
use super::pool::DbPool;

/// Runs Diesel operations either inside the transaction found in the
/// context or directly on a pooled connection.
///
/// # Example
///
/// ```ignore
/// use diesel_async::RunQueryDsl;
/// use diesel_async::scoped_futures::ScopedFutureExt as _;
///
/// let executor = transactor.executor();
/// executor
///     .run(&ctx, |conn| {
///         async move {
///             diesel::sql_query("INSERT INTO audit (entry) VALUES ('created')")
///                 .execute(conn)
///                 .await
///         }
///         .scope_boxed()
///     })
///     .await?;
/// ```
#[derive(Clone, Debug)]
pub struct PgExecutor {
    pool: DbPool,
    key: ContextKey,
}

impl PgExecutor {
    /// Executor bound to the transactor using `key`.
    #[must_use]
    pub const fn new(pool: DbPool, key: ContextKey) -> Self {
        Self { pool, key }
    }

    /// Run `operation`, redirecting it into the context's open transaction
    /// when there is one.
    ///
    /// # Errors
    ///
    /// - [`PgExecutorError::Context`] if `ctx` is cancelled or expired.
    /// - [`PgExecutorError::Transaction`] if the transaction is already
    ///   finalized, or if the key holds another backend's handle.
    /// - Connection and query errors from the pool and Diesel.
    pub async fn run<'a, T, F>(&self, ctx: &Context, operation: F) -> Result<T, PgExecutorError>
    where
        F: for<'r> FnOnce(&'r mut AsyncPgConnection) -> ScopedBoxFuture<'a, 'r, QueryResult<T>>
            + Send
            + 'a,
        T: Send + 'a,
    {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        if let Some(handle) = ctx.active_transaction(&self.key) {
            let Some(transaction) = handle.as_any().downcast_ref::<PgTransaction>() else {
                return Err(TransactionError::foreign_handle(self.key.name()).into());
            };
            return transaction.run(operation).await;
        }

        let mut connection = self.pool.get().await.map_err(map_pool_error)?;
        operation(&mut *connection).await.map_err(map_diesel_error)
    }
}
