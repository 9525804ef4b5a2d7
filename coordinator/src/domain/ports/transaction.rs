//! Port describing units of work against a single backend.
//!
//! A [`Transactor`] opens [`Transaction`]s and knows the [`ContextKey`] its
//! handles are stored under. Business logic never names a backend: it calls
//! `begin_ctx`, threads the returned [`Context`] through its calls, and then
//! finalizes with `commit_ctx` or `rollback_ctx`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::define_port_error;
use super::message_producer::OutboundMessage;
use crate::domain::context::{Context, ContextKey};

/// Ordered collection of failures gathered from a composite operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionErrors(Vec<TransactionError>);

impl TransactionErrors {
    /// Number of collected failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no failure was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the failures in child order.
    pub fn iter(&self) -> impl Iterator<Item = &TransactionError> {
        self.0.iter()
    }

    /// Consume into the underlying vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<TransactionError> {
        self.0
    }
}

impl From<Vec<TransactionError>> for TransactionErrors {
    fn from(errors: Vec<TransactionError>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for TransactionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
            first = false;
        }
        Ok(())
    }
}

define_port_error! {
    /// Errors raised while opening or finalizing a unit of work.
    pub enum TransactionError {
        /// The backend could not open a transaction.
        Begin { backend: String, message: String } =>
            "{backend}: failed to begin transaction: {message}",
        /// The backend failed to commit.
        Commit { backend: String, message: String } =>
            "{backend}: failed to commit transaction: {message}",
        /// The backend failed to roll back.
        Rollback { backend: String, message: String } =>
            "{backend}: failed to roll back transaction: {message}",
        /// Commit or rollback was called on a handle that is already finalized.
        AlreadyFinalized { backend: String } =>
            "{backend}: transaction already finalized",
        /// A write was attempted through a finalized handle.
        Closed { backend: String } => "{backend}: transaction closed",
        /// The broker accepted only part of a flushed batch.
        PartialDelivery { backend: String, delivered: usize, total: usize, message: String } =>
            "{backend}: delivered {delivered} of {total} buffered messages: {message}",
        /// The handle stored under this backend's key belongs to another adapter.
        ForeignHandle { backend: String } =>
            "{backend}: context holds a transaction handle of another backend",
        /// A fan-out task panicked or was cancelled before reporting.
        TaskFailed { message: String } => "transaction task failed: {message}",
        /// Several backends failed during one composite finalize.
        Aggregate { errors: TransactionErrors } => "multiple backends failed: {errors}",
    }
}

impl TransactionError {
    /// Flatten aggregates into the individual backend failures.
    #[must_use]
    pub fn backend_errors(&self) -> Vec<&Self> {
        match self {
            Self::Aggregate { errors } => errors.iter().flat_map(Self::backend_errors).collect(),
            other => vec![other],
        }
    }
}

/// Capability implemented by transactions that buffer outgoing messages.
///
/// Publishing clients query for it through
/// [`Transaction::as_message_appender`] instead of matching on concrete
/// transaction types.
pub trait MessageAppender: Send + Sync {
    /// Queue messages for delivery when the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Closed`] once the transaction has been
    /// finalized.
    fn append(&self, messages: Vec<OutboundMessage>) -> Result<(), TransactionError>;
}

/// An open unit of work against one backend.
///
/// Handles are shared through contexts, so finalization takes `&self`.
/// Exactly one commit or rollback succeeds; later calls return
/// [`TransactionError::AlreadyFinalized`].
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Backend label used in errors and logs.
    fn backend(&self) -> &str;

    /// Make the unit of work durable.
    async fn commit(&self) -> Result<(), TransactionError>;

    /// Discard the unit of work.
    async fn rollback(&self) -> Result<(), TransactionError>;

    /// The context that was current at begin time, with this handle attached.
    fn context(&self) -> Context;

    /// True once commit or rollback has been attempted.
    fn is_finalized(&self) -> bool;

    /// Concrete handle access for clients of the same adapter family.
    fn as_any(&self) -> &dyn Any;

    /// Message-buffering capability, if this backend supports it.
    fn as_message_appender(&self) -> Option<&dyn MessageAppender> {
        None
    }
}

/// Factory and lifecycle manager for transactions against one backend.
#[async_trait]
pub trait Transactor: Send + Sync {
    /// Backend label used in errors and logs.
    fn name(&self) -> &str;

    /// Open a new unit of work.
    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>, TransactionError>;

    /// Open a unit of work and return a derived context carrying it.
    async fn begin_ctx(&self, ctx: &Context) -> Result<Context, TransactionError> {
        let transaction = self.begin(ctx).await?;
        Ok(transaction.context())
    }

    /// Commit the transaction this transactor attached to `ctx`, if any.
    async fn commit_ctx(&self, ctx: &Context) -> Result<(), TransactionError>;

    /// Roll back the transaction this transactor attached to `ctx`, if any.
    async fn rollback_ctx(&self, ctx: &Context) -> Result<(), TransactionError>;
}

/// Terminal action applied to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// Commit the transaction.
    Commit,
    /// Roll the transaction back.
    Rollback,
}

impl Finalize {
    /// Lower-case label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    /// Apply this action to `transaction`.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's commit or rollback error.
    pub async fn apply(self, transaction: &dyn Transaction) -> Result<(), TransactionError> {
        match self {
            Self::Commit => transaction.commit().await,
            Self::Rollback => transaction.rollback().await,
        }
    }
}

/// Finalize the handle stored under `key`.
///
/// A context with nothing under `key` is not an error: not every unit of work
/// touches every backend.
///
/// # Errors
///
/// Propagates the handle's commit or rollback error.
pub async fn finalize_attached(
    ctx: &Context,
    key: &ContextKey,
    backend: &str,
    action: Finalize,
) -> Result<(), TransactionError> {
    let Some(transaction) = ctx.attached_transaction(key) else {
        debug!(backend, action = action.as_str(), "no transaction attached");
        return Ok(());
    };
    action.apply(transaction.as_ref()).await
}
