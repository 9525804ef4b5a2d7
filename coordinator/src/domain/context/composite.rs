//! Context node merging the contexts produced by several transactors.
//!
//! The composite transactor hands every child the same base context and gets
//! back one derived context per child, each holding that child's transaction
//! handle. [`CompositeContext`] presents those N parents as one: lookups and
//! error checks scan the parents in order and return the first hit.
//!
//! Cancellation is observable through [`Context::err`] only. A composite node
//! has no fan-in signal, so [`Context::done`] never resolves on it and
//! [`Context::deadline`] stops at it. Callers that need channel-style
//! cancellation should select on the base context they passed to
//! `begin_ctx`.

use std::any::Any;
use std::sync::Arc;

use super::{Context, ContextError, ContextKey};

/// Ordered set of parent contexts behaving as a single context.
#[derive(Debug, Clone)]
pub struct CompositeContext {
    parents: Arc<[Context]>,
}

impl CompositeContext {
    pub(super) fn new(parents: Vec<Context>) -> Self {
        Self {
            parents: parents.into(),
        }
    }

    /// Parent contexts in fan-out order.
    #[must_use]
    pub fn parents(&self) -> &[Context] {
        &self.parents
    }

    /// Number of parent contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// True when the composite wraps no parents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub(super) fn lookup(
        &self,
        key: &ContextKey,
        respect_opt_out: bool,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        self.parents
            .iter()
            .find_map(|parent| parent.lookup(key, respect_opt_out))
    }

    pub(super) fn err(&self) -> Option<ContextError> {
        self.parents.iter().find_map(Context::err)
    }

    pub(super) fn is_transaction_disabled(&self) -> bool {
        self.parents.iter().any(Context::is_transaction_disabled)
    }
}
