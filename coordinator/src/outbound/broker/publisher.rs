//! Publishing client that honours the transaction in the context.

use std::sync::Arc;

use tracing::debug;

use crate::domain::ports::{MessageProducer, OutboundMessage, ProducerError, TransactionError};
use crate::domain::{Context, ContextError, ContextKey};

/// Errors surfaced by [`Publisher::publish`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The enclosing transaction is closed or cannot buffer messages.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// Direct delivery failed.
    #[error(transparent)]
    Producer(#[from] ProducerError),
    /// The context was cancelled or expired before publishing.
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Where a publish went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the open transaction; delivered when it commits.
    Buffered,
    /// Sent to the broker immediately.
    Sent,
}

/// Client for one broker, keyed like the transactor it pairs with.
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn MessageProducer>,
    key: ContextKey,
    label: Arc<str>,
}

impl Publisher {
    /// Publisher buffering into handles stored under `key`.
    #[must_use]
    pub fn new(producer: Arc<dyn MessageProducer>, key: ContextKey) -> Self {
        Self {
            producer,
            key,
            label: Arc::from(key.name()),
        }
    }

    /// Name reported in errors and logs in place of the key's name.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Publish `messages` under `ctx`.
    ///
    /// With a transaction in scope the messages are appended to its buffer;
    /// otherwise, or under [`Context::without_transaction`], they are sent
    /// straight away.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Context`] if `ctx` is cancelled or expired.
    /// - [`TransactionError::Closed`] once the transaction is finalized.
    /// - [`TransactionError::ForeignHandle`] if the handle under this key
    ///   cannot buffer messages.
    /// - The producer's error when sending directly.
    pub async fn publish(
        &self,
        ctx: &Context,
        messages: Vec<OutboundMessage>,
    ) -> Result<Delivery, PublishError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        if let Some(transaction) = ctx.active_transaction(&self.key) {
            let Some(appender) = transaction.as_message_appender() else {
                return Err(TransactionError::foreign_handle(&*self.label).into());
            };
            let count = messages.len();
            appender.append(messages)?;
            debug!(backend = &*self.label, count, "messages buffered");
            return Ok(Delivery::Buffered);
        }

        if messages.is_empty() {
            return Ok(Delivery::Sent);
        }
        self.producer.send(&messages).await?;
        debug!(backend = &*self.label, count = messages.len(), "messages sent");
        Ok(Delivery::Sent)
    }

    /// Publish a single message.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish_one(
        &self,
        ctx: &Context,
        message: OutboundMessage,
    ) -> Result<Delivery, PublishError> {
        self.publish(ctx, vec![message]).await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("key", &self.key)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
