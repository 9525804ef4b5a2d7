//! Composite transactor presenting N backends as one.
//!
//! Every operation is issued to all children concurrently, one `tokio` task
//! per child, and joined before returning. Children are independent: a
//! failure in one never stops the others from receiving their call.
//!
//! Coordination is best-effort. Each backend keeps its own atomicity, but
//! nothing here makes a commit atomic across backends: if the relational
//! commit succeeds and the broker flush fails, the relational side stays
//! committed.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use super::context::Context;
use super::ports::{Finalize, Transaction, TransactionError, Transactor};

const COMPOSITE_BACKEND: &str = "composite";

/// Spawn one task per `(child name, future)` pair and wait for all of them.
///
/// A task that panics or is aborted is reported as
/// [`TransactionError::TaskFailed`] naming its child.
async fn join_tasks<T, Fut>(
    operation: &'static str,
    tasks: Vec<(String, Fut)>,
) -> Vec<Result<T, TransactionError>>
where
    Fut: Future<Output = Result<T, TransactionError>> + Send + 'static,
    T: Send + 'static,
{
    let (names, handles): (Vec<_>, Vec<_>) = tasks
        .into_iter()
        .map(|(name, task)| (name, tokio::spawn(task)))
        .unzip();
    join_all(handles)
        .await
        .into_iter()
        .zip(names)
        .map(|(joined, child)| {
            joined.unwrap_or_else(|join_error| {
                warn!(
                    operation,
                    child = %child,
                    error = %join_error,
                    "fan-out task did not complete"
                );
                Err(TransactionError::task_failed(format!(
                    "{operation} on {child}: {join_error}"
                )))
            })
        })
        .collect()
}

/// Keep every successful value, or fail with the lowest-index error.
fn collect_begun<T>(
    operation: &'static str,
    results: Vec<Result<T, TransactionError>>,
) -> Result<Vec<T>, TransactionError> {
    let children = results.len();
    let mut begun = Vec::with_capacity(children);
    let mut first_error = None;
    for result in results {
        match result {
            Ok(value) => begun.push(value),
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    match first_error {
        None => Ok(begun),
        Some(error) => {
            warn!(
                operation,
                children,
                began = begun.len(),
                kind = error.kind(),
                error = %error,
                "composite begin failed; siblings that began are released without rollback"
            );
            Err(error)
        }
    }
}

/// Collapse finalize outcomes: one failure is returned as-is, several are
/// aggregated in child order.
fn join_errors(
    operation: &'static str,
    results: Vec<Result<(), TransactionError>>,
) -> Result<(), TransactionError> {
    let children = results.len();
    let mut errors: Vec<TransactionError> = results.into_iter().filter_map(Result::err).collect();
    debug!(operation, children, failures = errors.len(), "fan-out finished");
    for error in &errors {
        warn!(operation, kind = error.kind(), error = %error, "child finalize failed");
    }

    if errors.len() > 1 {
        return Err(TransactionError::aggregate(errors));
    }
    errors.pop().map_or(Ok(()), Err)
}

/// Aggregates child transactors behind the single [`Transactor`] contract.
///
/// Child order carries no meaning for correctness; it only fixes the order in
/// which errors and parent contexts are reported.
#[derive(Clone)]
pub struct CompositeTransactor {
    children: Arc<[Arc<dyn Transactor>]>,
}

impl CompositeTransactor {
    /// Compose the given transactors.
    #[must_use]
    pub fn new(children: Vec<Arc<dyn Transactor>>) -> Self {
        Self {
            children: children.into(),
        }
    }

    /// Start building a composite one child at a time.
    #[must_use]
    pub fn builder() -> CompositeTransactorBuilder {
        CompositeTransactorBuilder::default()
    }

    /// Number of child transactors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when no children were supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Names of the children in fan-out order.
    #[must_use]
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.name()).collect()
    }

    async fn finalize_ctx(&self, ctx: &Context, action: Finalize) -> Result<(), TransactionError> {
        let tasks: Vec<_> = self
            .children
            .iter()
            .map(|child| {
                let child = Arc::clone(child);
                let ctx = ctx.clone();
                let name = child.name().to_owned();
                let task = async move {
                    match action {
                        Finalize::Commit => child.commit_ctx(&ctx).await,
                        Finalize::Rollback => child.rollback_ctx(&ctx).await,
                    }
                };
                (name, task)
            })
            .collect();
        join_errors(action.as_str(), join_tasks(action.as_str(), tasks).await)
    }
}

impl std::fmt::Debug for CompositeTransactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTransactor")
            .field("children", &self.child_names())
            .finish()
    }
}

#[async_trait]
impl Transactor for CompositeTransactor {
    fn name(&self) -> &str {
        COMPOSITE_BACKEND
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>, TransactionError> {
        let tasks: Vec<_> = self
            .children
            .iter()
            .map(|child| {
                let child = Arc::clone(child);
                let ctx = ctx.clone();
                (child.name().to_owned(), async move { child.begin(&ctx).await })
            })
            .collect();
        let children = collect_begun("begin", join_tasks("begin", tasks).await)?;
        debug!(children = children.len(), "composite transaction begun");
        Ok(Arc::new(CompositeTransaction::new(children)))
    }

    async fn begin_ctx(&self, ctx: &Context) -> Result<Context, TransactionError> {
        let tasks: Vec<_> = self
            .children
            .iter()
            .map(|child| {
                let child = Arc::clone(child);
                let ctx = ctx.clone();
                (child.name().to_owned(), async move { child.begin_ctx(&ctx).await })
            })
            .collect();
        let parents = collect_begun("begin_ctx", join_tasks("begin_ctx", tasks).await)?;
        debug!(children = parents.len(), "composite context begun");
        Ok(Context::composite(parents))
    }

    async fn commit_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
        self.finalize_ctx(ctx, Finalize::Commit).await
    }

    async fn rollback_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
        self.finalize_ctx(ctx, Finalize::Rollback).await
    }
}

/// Incrementally assembles a [`CompositeTransactor`].
#[derive(Default)]
pub struct CompositeTransactorBuilder {
    children: Vec<Arc<dyn Transactor>>,
}

impl CompositeTransactorBuilder {
    /// Append an owned child transactor.
    #[must_use]
    pub fn with<T>(self, child: T) -> Self
    where
        T: Transactor + 'static,
    {
        self.with_shared(Arc::new(child))
    }

    /// Append a shared child transactor.
    #[must_use]
    pub fn with_shared(mut self, child: Arc<dyn Transactor>) -> Self {
        self.children.push(child);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> CompositeTransactor {
        CompositeTransactor::new(self.children)
    }
}

/// Transaction returned by [`CompositeTransactor::begin`], owning one handle
/// per child.
///
/// The handle finalizes once, even with no children: a second commit or
/// rollback is refused before reaching any child.
pub struct CompositeTransaction {
    children: Vec<Arc<dyn Transaction>>,
    finalized: AtomicBool,
}

impl CompositeTransaction {
    fn new(children: Vec<Arc<dyn Transaction>>) -> Self {
        Self {
            children,
            finalized: AtomicBool::new(false),
        }
    }

    /// Child handles in fan-out order.
    #[must_use]
    pub fn children(&self) -> &[Arc<dyn Transaction>] {
        &self.children
    }

    async fn finalize(&self, action: Finalize) -> Result<(), TransactionError> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(TransactionError::already_finalized(COMPOSITE_BACKEND));
        }
        let tasks: Vec<_> = self
            .children
            .iter()
            .map(|child| {
                let child = Arc::clone(child);
                (child.backend().to_owned(), async move { action.apply(child.as_ref()).await })
            })
            .collect();
        join_errors(action.as_str(), join_tasks(action.as_str(), tasks).await)
    }
}

#[async_trait]
impl Transaction for CompositeTransaction {
    fn backend(&self) -> &str {
        COMPOSITE_BACKEND
    }

    async fn commit(&self) -> Result<(), TransactionError> {
        self.finalize(Finalize::Commit).await
    }

    async fn rollback(&self) -> Result<(), TransactionError> {
        self.finalize(Finalize::Rollback).await
    }

    fn context(&self) -> Context {
        Context::composite(self.children.iter().map(|child| child.context()).collect())
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    //! Outcome folding for fan-out results.

    use super::*;
    use futures_util::FutureExt as _;
    use futures_util::future::BoxFuture;
    use rstest::rstest;

    #[rstest]
    fn single_failure_is_returned_unwrapped() {
        let results = vec![Ok(()), Err(TransactionError::closed("broker")), Ok(())];

        assert_eq!(
            join_errors("commit", results),
            Err(TransactionError::closed("broker"))
        );
    }

    #[rstest]
    fn several_failures_are_aggregated_in_order() {
        let results = vec![
            Err(TransactionError::closed("a")),
            Ok(()),
            Err(TransactionError::closed("c")),
        ];

        let error = join_errors("rollback", results).expect_err("aggregated");

        assert_eq!(
            error,
            TransactionError::aggregate(vec![
                TransactionError::closed("a"),
                TransactionError::closed("c"),
            ])
        );
    }

    #[rstest]
    fn begin_reports_lowest_index_failure() {
        let results: Vec<Result<u8, TransactionError>> = vec![
            Ok(1),
            Err(TransactionError::begin("second", "refused")),
            Err(TransactionError::begin("third", "refused")),
        ];

        assert_eq!(
            collect_begun("begin", results),
            Err(TransactionError::begin("second", "refused"))
        );
    }

    async fn succeed() -> Result<(), TransactionError> {
        Ok(())
    }

    async fn explode() -> Result<(), TransactionError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_task_becomes_task_failed() {
        let tasks: Vec<(String, BoxFuture<'static, Result<(), TransactionError>>)> = vec![
            ("postgres".to_owned(), succeed().boxed()),
            ("broker".to_owned(), explode().boxed()),
        ];

        let results = join_tasks("commit", tasks).await;

        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(TransactionError::TaskFailed { message }) if message.starts_with("commit on broker:")
        ));
    }

    #[tokio::test]
    async fn empty_composite_transaction_finalizes_once() {
        let transaction = CompositeTransactor::builder()
            .build()
            .begin(&Context::background())
            .await
            .expect("nothing to fail");

        assert!(!transaction.is_finalized());
        assert_eq!(transaction.commit().await, Ok(()));
        assert!(transaction.is_finalized());
        assert_eq!(
            transaction.commit().await,
            Err(TransactionError::already_finalized(COMPOSITE_BACKEND))
        );
        assert_eq!(
            transaction.rollback().await,
            Err(TransactionError::already_finalized(COMPOSITE_BACKEND))
        );
    }

    #[tokio::test]
    async fn empty_composite_begins_an_empty_context() {
        let composite = CompositeTransactor::builder().build();

        let ctx = composite
            .begin_ctx(&Context::background())
            .await
            .expect("nothing to fail");

        assert!(composite.is_empty());
        assert!(ctx.as_composite().is_some_and(|c| c.is_empty()));
        assert_eq!(composite.commit_ctx(&ctx).await, Ok(()));
    }
}
