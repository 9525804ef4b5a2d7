//! Port for the message broker producer used by the broker adapter.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::define_port_error;

/// A message waiting to be delivered to the broker.
///
/// The identifier is minted on construction and travels with the message, so
/// consumers can de-duplicate redeliveries across a failed flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Unique message identifier.
    pub id: Uuid,
    /// Destination topic.
    pub topic: String,
    /// Optional partitioning key.
    pub key: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Header name/value pairs in insertion order.
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Build a message with a raw payload.
    ///
    /// # Examples
    /// ```
    /// use coordinator::domain::ports::OutboundMessage;
    ///
    /// let message = OutboundMessage::new("orders", b"created".to_vec())
    ///     .with_key("order-17")
    ///     .with_header("trace-id", "abc");
    /// assert_eq!(message.topic, "orders");
    /// assert_eq!(message.key.as_deref(), Some("order-17"));
    /// ```
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Build a message whose payload is `value` serialised as JSON.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error if `value` cannot be encoded.
    pub fn json<T>(topic: impl Into<String>, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(topic, payload).with_header("content-type", "application/json"))
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

define_port_error! {
    /// Errors surfaced by the broker producer.
    pub enum ProducerError {
        /// The broker could not be reached.
        Unavailable { message: String } => "message producer unavailable: {message}",
        /// The broker refused the batch after accepting a prefix of it.
        Rejected { delivered: usize, message: String } =>
            "message producer rejected batch after {delivered} deliveries: {message}",
    }
}

impl ProducerError {
    /// Messages the broker accepted before failing.
    #[must_use]
    pub const fn delivered(&self) -> usize {
        match self {
            Self::Unavailable { .. } => 0,
            Self::Rejected { delivered, .. } => *delivered,
        }
    }
}

/// Producer client for one broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Deliver `messages` in order as a single synchronous batch.
    async fn send(&self, messages: &[OutboundMessage]) -> Result<(), ProducerError>;

    /// Flush and release the underlying client.
    async fn close(&self) -> Result<(), ProducerError>;
}
