//! Buffered pseudo-transaction for message brokers.
//!
//! Brokers offer no transaction primitive here, so one is simulated: begin
//! opens an empty in-memory buffer, publishes made under the transaction are
//! appended to it, commit flushes the buffer as a single batch and rollback
//! drops it.
//!
//! A flush that fails partway may already have delivered a prefix of the
//! batch. That prefix is not recalled, and the relational side of a
//! composite is not rolled back: delivery is at-least-once across the commit
//! boundary, not exactly-once.

use std::any::Any;
use std::mem;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::ports::{
    Finalize, MessageAppender, MessageProducer, OutboundMessage, Transaction, TransactionError,
    Transactor, finalize_attached,
};
use crate::domain::{Context, ContextKey};

use super::publisher::Publisher;

static BROKER_KEY: LazyLock<ContextKey> = LazyLock::new(|| ContextKey::new("broker"));

/// Transactor producing [`BufferedTransaction`]s over one producer.
#[derive(Clone)]
pub struct BufferedTransactor {
    producer: Arc<dyn MessageProducer>,
    key: ContextKey,
    label: Arc<str>,
}

impl BufferedTransactor {
    /// Transactor storing its handles under [`BufferedTransactor::family_key`].
    #[must_use]
    pub fn new(producer: Arc<dyn MessageProducer>) -> Self {
        Self::with_key(producer, Self::family_key())
    }

    /// Transactor storing its handles under a caller-supplied key.
    #[must_use]
    pub fn with_key(producer: Arc<dyn MessageProducer>, key: ContextKey) -> Self {
        Self {
            producer,
            key,
            label: Arc::from(key.name()),
        }
    }

    /// Report this transactor and its handles under `label` instead of the
    /// key's name.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Process-wide key shared by transactors built with
    /// [`BufferedTransactor::new`].
    #[must_use]
    pub fn family_key() -> ContextKey {
        *BROKER_KEY
    }

    /// Key this transactor stores its handles under.
    #[must_use]
    pub const fn key(&self) -> ContextKey {
        self.key
    }

    /// Client that buffers into this transactor's handles.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.producer), self.key).with_label(Arc::clone(&self.label))
    }
}

impl std::fmt::Debug for BufferedTransactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedTransactor")
            .field("key", &self.key)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transactor for BufferedTransactor {
    fn name(&self) -> &str {
        &self.label
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>, TransactionError> {
        if let Some(reason) = ctx.err() {
            return Err(TransactionError::begin(self.name(), reason.to_string()));
        }
        debug!(backend = self.name(), "broker buffer opened");
        let transaction: Arc<dyn Transaction> = BufferedTransaction::open(
            Arc::clone(&self.producer),
            ctx.clone(),
            self.key,
            Arc::clone(&self.label),
        );
        Ok(transaction)
    }

    async fn commit_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
        finalize_attached(ctx, &self.key, self.name(), Finalize::Commit).await
    }

    async fn rollback_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
        finalize_attached(ctx, &self.key, self.name(), Finalize::Rollback).await
    }
}

#[derive(Debug)]
enum BufferState {
    Open(Vec<OutboundMessage>),
    Committed,
    RolledBack,
}

/// In-memory buffer of messages awaiting commit.
pub struct BufferedTransaction {
    this: Weak<Self>,
    origin: Context,
    key: ContextKey,
    label: Arc<str>,
    producer: Arc<dyn MessageProducer>,
    state: Mutex<BufferState>,
}

impl BufferedTransaction {
    fn open(
        producer: Arc<dyn MessageProducer>,
        origin: Context,
        key: ContextKey,
        label: Arc<str>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            origin,
            key,
            label,
            producer,
            state: Mutex::new(BufferState::Open(Vec::new())),
        })
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Number of messages waiting for commit; zero once finalized.
    #[must_use]
    pub fn pending(&self) -> usize {
        match &*self.state() {
            BufferState::Open(messages) => messages.len(),
            BufferState::Committed | BufferState::RolledBack => 0,
        }
    }

    fn take_buffer(&self, next: BufferState) -> Result<Vec<OutboundMessage>, TransactionError> {
        let mut state = self.state();
        match mem::replace(&mut *state, next) {
            BufferState::Open(messages) => Ok(messages),
            previous => {
                *state = previous;
                Err(TransactionError::already_finalized(self.backend()))
            }
        }
    }
}

impl MessageAppender for BufferedTransaction {
    fn append(&self, messages: Vec<OutboundMessage>) -> Result<(), TransactionError> {
        match &mut *self.state() {
            BufferState::Open(buffer) => {
                buffer.extend(messages);
                Ok(())
            }
            BufferState::Committed | BufferState::RolledBack => {
                Err(TransactionError::closed(self.backend()))
            }
        }
    }
}

#[async_trait]
impl Transaction for BufferedTransaction {
    fn backend(&self) -> &str {
        &self.label
    }

    async fn commit(&self) -> Result<(), TransactionError> {
        let messages = self.take_buffer(BufferState::Committed)?;
        let total = messages.len();
        if total == 0 {
            debug!(backend = self.backend(), "broker commit with empty buffer");
            return Ok(());
        }

        match self.producer.send(&messages).await {
            Ok(()) => {
                debug!(backend = self.backend(), delivered = total, "broker buffer flushed");
                Ok(())
            }
            Err(error) => {
                let delivered = error.delivered();
                warn!(
                    backend = self.backend(),
                    delivered,
                    total,
                    kind = error.kind(),
                    error = %error,
                    "broker flush failed"
                );
                if delivered == 0 {
                    Err(TransactionError::commit(self.backend(), error.to_string()))
                } else {
                    Err(TransactionError::partial_delivery(
                        self.backend(),
                        delivered,
                        total,
                        error.to_string(),
                    ))
                }
            }
        }
    }

    async fn rollback(&self) -> Result<(), TransactionError> {
        let discarded = self.take_buffer(BufferState::RolledBack)?.len();
        debug!(backend = self.backend(), discarded, "broker buffer discarded");
        Ok(())
    }

    fn context(&self) -> Context {
        match self.this.upgrade() {
            Some(this) => self.origin.with_transaction(self.key, this),
            None => self.origin.clone(),
        }
    }

    fn is_finalized(&self) -> bool {
        !matches!(&*self.state(), BufferState::Open(_))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message_appender(&self) -> Option<&dyn MessageAppender> {
        Some(self)
    }
}
