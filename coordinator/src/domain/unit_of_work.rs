//! Scoped helper that begins, runs and finalizes one unit of work.

use std::fmt;
use std::future::Future;

use tracing::warn;

use super::context::Context;
use super::ports::{TransactionError, Transactor};

/// Run `work` inside a unit of work opened by `transactor`.
///
/// `work` receives the transactional context. When it returns `Ok`, the
/// unit of work is committed and a commit failure is returned. When it
/// returns `Err`, the unit of work is rolled back and the work error is
/// returned; a rollback failure is only logged.
///
/// # Errors
///
/// Returns begin and commit failures converted into `E`, or the error
/// produced by `work`.
///
/// # Examples
/// ```
/// use coordinator::domain::{Context, CompositeTransactor, TransactionError, run_in_transaction};
///
/// # let runtime = tokio::runtime::Runtime::new().expect("runtime");
/// # runtime.block_on(async {
/// let transactor = CompositeTransactor::builder().build();
/// let answer = run_in_transaction(&transactor, &Context::background(), |_ctx| async {
///     Ok::<_, TransactionError>(42)
/// })
/// .await?;
/// assert_eq!(answer, 42);
/// # Ok::<(), TransactionError>(())
/// # }).expect("unit of work");
/// ```
pub async fn run_in_transaction<T, E, F, Fut, X>(
    transactor: &X,
    ctx: &Context,
    work: F,
) -> Result<T, E>
where
    X: Transactor + ?Sized,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<TransactionError> + fmt::Display,
{
    let tx_ctx = transactor.begin_ctx(ctx).await?;
    match work(tx_ctx.clone()).await {
        Ok(value) => {
            transactor.commit_ctx(&tx_ctx).await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = transactor.rollback_ctx(&tx_ctx).await {
                warn!(
                    transactor = transactor.name(),
                    error = %error,
                    rollback_kind = rollback_error.kind(),
                    rollback_error = %rollback_error,
                    "rollback after failed unit of work also failed"
                );
            }
            Err(error)
        }
    }
}
