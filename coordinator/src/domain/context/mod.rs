//! Request-scoped context threaded through business logic.
//!
//! A [`Context`] is an immutable tree of nodes. Every derivation
//! (`with_value`, `with_cancel`, `with_deadline`, `without_transaction`)
//! produces a new child and leaves the parent untouched, so a context can be
//! cloned freely and shared across tasks.
//!
//! Transaction handles travel through the context under opaque
//! [`ContextKey`]s. Adapter clients look up their own key to decide whether a
//! write belongs to an open unit of work or should auto-commit.
//!
//! ```
//! use coordinator::domain::{Context, ContextKey};
//!
//! let tenant = ContextKey::new("tenant");
//! let ctx = Context::background().with_value(tenant, String::from("acme"));
//!
//! assert_eq!(ctx.value::<String>(&tenant).as_deref().map(String::as_str), Some("acme"));
//! assert!(Context::background().value::<String>(&tenant).is_none());
//! ```

mod composite;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt as _;
use futures_util::future::{self, BoxFuture};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use super::ports::Transaction;

pub use composite::CompositeContext;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque key used to store and retrieve values from a [`Context`].
///
/// Keys compare by identity: two keys are equal only when they were produced
/// by the same call to [`ContextKey::new`]. The name is for diagnostics only,
/// so two backends that both pick `"sql"` still never collide.
#[derive(Clone, Copy)]
pub struct ContextKey {
    id: u64,
    name: &'static str,
}

impl ContextKey {
    /// Mint a fresh key, distinct from every other key in the process.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }

    /// Diagnostic name supplied at construction.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ContextKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContextKey {}

impl Hash for ContextKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({}#{})", self.name, self.id)
    }
}

/// Reason a context stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context, or one of its ancestors, was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Handle that cancels the context returned alongside it.
///
/// Dropping the handle without calling [`CancelHandle::cancel`] leaves the
/// context live for as long as its ancestors are.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the associated context and every context derived from it.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Debug, Clone)]
struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    fn pair() -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        (Self { receiver }, CancelHandle { sender })
    }

    fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // Handle dropped without cancelling: this signal can never fire.
            future::pending::<()>().await;
        }
    }
}

/// Stored under a transactor's key; keeps arbitrary values from being
/// mistaken for transaction handles.
struct TransactionSlot(Arc<dyn Transaction>);

enum Node {
    Background,
    Value {
        parent: Context,
        key: ContextKey,
        value: Arc<dyn Any + Send + Sync>,
    },
    Cancel {
        parent: Context,
        signal: CancelSignal,
    },
    Deadline {
        parent: Context,
        at: Instant,
        signal: CancelSignal,
    },
    NoTransaction {
        parent: Context,
    },
    Composite(CompositeContext),
}

impl Node {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Value { .. } => "value",
            Self::Cancel { .. } => "cancel",
            Self::Deadline { .. } => "deadline",
            Self::NoTransaction { .. } => "no-transaction",
            Self::Composite(_) => "composite",
        }
    }
}

/// Immutable, cheaply cloneable request-scoped context.
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.node.kind())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Root context: no values, never cancelled, no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::from_node(Node::Background)
    }

    fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    pub(crate) fn composite(parents: Vec<Self>) -> Self {
        Self::from_node(Node::Composite(CompositeContext::new(parents)))
    }

    /// Derive a child carrying `value` under `key`.
    #[must_use]
    pub fn with_value<T>(&self, key: ContextKey, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.with_shared_value(key, Arc::new(value))
    }

    /// Derive a child carrying an already shared value under `key`.
    #[must_use]
    pub fn with_shared_value(&self, key: ContextKey, value: Arc<dyn Any + Send + Sync>) -> Self {
        Self::from_node(Node::Value {
            parent: self.clone(),
            key,
            value,
        })
    }

    /// Derive a cancellable child.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (signal, handle) = CancelSignal::pair();
        let ctx = Self::from_node(Node::Cancel {
            parent: self.clone(),
            signal,
        });
        (ctx, handle)
    }

    /// Derive a child that expires at `at`. The handle cancels it early.
    #[must_use]
    pub fn with_deadline(&self, at: Instant) -> (Self, CancelHandle) {
        let (signal, handle) = CancelSignal::pair();
        let ctx = Self::from_node(Node::Deadline {
            parent: self.clone(),
            at,
            signal,
        });
        (ctx, handle)
    }

    /// Derive a child that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child in which adapter clients bypass any enclosing
    /// transaction and run their operations directly.
    ///
    /// Transactions attached *below* this point (i.e. begun from the
    /// returned context) are still visible.
    #[must_use]
    pub fn without_transaction(&self) -> Self {
        Self::from_node(Node::NoTransaction {
            parent: self.clone(),
        })
    }

    /// Attach a transaction handle under `key`.
    #[must_use]
    pub fn with_transaction(&self, key: ContextKey, transaction: Arc<dyn Transaction>) -> Self {
        self.with_value(key, TransactionSlot(transaction))
    }

    /// Look up a typed value, nearest node first.
    #[must_use]
    pub fn value<T>(&self, key: &ContextKey) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.value_any(key)?.downcast::<T>().ok()
    }

    /// Look up an untyped value, nearest node first.
    #[must_use]
    pub fn value_any(&self, key: &ContextKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.lookup(key, false)
    }

    /// Transaction handle stored under `key`, regardless of any
    /// no-transaction opt-out. Used when finalizing.
    #[must_use]
    pub fn attached_transaction(&self, key: &ContextKey) -> Option<Arc<dyn Transaction>> {
        Self::unwrap_slot(self.lookup(key, false)?)
    }

    /// Transaction handle that adapter clients should write through, or
    /// `None` if there is none or an opt-out hides it.
    #[must_use]
    pub fn active_transaction(&self, key: &ContextKey) -> Option<Arc<dyn Transaction>> {
        Self::unwrap_slot(self.lookup(key, true)?)
    }

    fn unwrap_slot(value: Arc<dyn Any + Send + Sync>) -> Option<Arc<dyn Transaction>> {
        value
            .downcast::<TransactionSlot>()
            .ok()
            .map(|slot| Arc::clone(&slot.0))
    }

    pub(crate) fn lookup(
        &self,
        key: &ContextKey,
        respect_opt_out: bool,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut current = self;
        loop {
            match current.node.as_ref() {
                Node::Background => return None,
                Node::Value {
                    parent,
                    key: held,
                    value,
                } => {
                    if held == key {
                        return Some(Arc::clone(value));
                    }
                    current = parent;
                }
                Node::NoTransaction { parent } => {
                    if respect_opt_out {
                        return None;
                    }
                    current = parent;
                }
                Node::Cancel { parent, .. } | Node::Deadline { parent, .. } => current = parent,
                Node::Composite(composite) => return composite.lookup(key, respect_opt_out),
            }
        }
    }

    /// True when a no-transaction opt-out sits anywhere on this context's
    /// ancestry.
    #[must_use]
    pub fn is_transaction_disabled(&self) -> bool {
        let mut current = self;
        loop {
            match current.node.as_ref() {
                Node::Background => return false,
                Node::NoTransaction { .. } => return true,
                Node::Value { parent, .. }
                | Node::Cancel { parent, .. }
                | Node::Deadline { parent, .. } => current = parent,
                Node::Composite(composite) => return composite.is_transaction_disabled(),
            }
        }
    }

    /// Why this context is no longer usable, if it has been cancelled or has
    /// expired.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        let mut current = self;
        loop {
            match current.node.as_ref() {
                Node::Background => return None,
                Node::Cancel { parent, signal } => {
                    if signal.is_cancelled() {
                        return Some(ContextError::Cancelled);
                    }
                    current = parent;
                }
                Node::Deadline { parent, at, signal } => {
                    if signal.is_cancelled() {
                        return Some(ContextError::Cancelled);
                    }
                    if Instant::now() >= *at {
                        return Some(ContextError::DeadlineExceeded);
                    }
                    current = parent;
                }
                Node::Value { parent, .. } | Node::NoTransaction { parent } => current = parent,
                Node::Composite(composite) => return composite.err(),
            }
        }
    }

    /// Earliest deadline on this context's ancestry.
    ///
    /// Composite contexts report no deadline of their own; see
    /// [`CompositeContext`].
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut current = self;
        loop {
            match current.node.as_ref() {
                Node::Background | Node::Composite(_) => return earliest,
                Node::Deadline { parent, at, .. } => {
                    earliest = Some(earliest.map_or(*at, |seen| seen.min(*at)));
                    current = parent;
                }
                Node::Value { parent, .. }
                | Node::Cancel { parent, .. }
                | Node::NoTransaction { parent } => current = parent,
            }
        }
    }

    /// Future resolving once this context is cancelled or expires.
    ///
    /// Never resolves for [`Context::background`] or for a composite node.
    #[must_use]
    pub fn done(&self) -> BoxFuture<'static, ContextError> {
        match self.node.as_ref() {
            Node::Background | Node::Composite(_) => future::pending().boxed(),
            Node::Value { parent, .. } | Node::NoTransaction { parent } => parent.done(),
            Node::Cancel { parent, signal } => {
                let signal = signal.clone();
                let parent_done = parent.done();
                async move {
                    tokio::select! {
                        () = signal.cancelled() => ContextError::Cancelled,
                        reason = parent_done => reason,
                    }
                }
                .boxed()
            }
            Node::Deadline { parent, at, signal } => {
                let signal = signal.clone();
                let at = *at;
                let parent_done = parent.done();
                async move {
                    tokio::select! {
                        () = signal.cancelled() => ContextError::Cancelled,
                        () = tokio::time::sleep_until(at) => ContextError::DeadlineExceeded,
                        reason = parent_done => reason,
                    }
                }
                .boxed()
            }
        }
    }

    /// The composite node at the head of this context, if any.
    #[must_use]
    pub fn as_composite(&self) -> Option<&CompositeContext> {
        match self.node.as_ref() {
            Node::Composite(composite) => Some(composite),
            _ => None,
        }
    }
}
