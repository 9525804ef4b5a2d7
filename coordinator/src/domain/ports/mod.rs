//! Domain ports and supporting types for the hexagonal boundary.
//!
//! Ports describe how the coordinator expects to interact with driven
//! adapters (relational stores, message brokers). Each trait exposes strongly
//! typed errors so adapters map their failures into predictable variants.

mod macros;
pub(crate) use macros::define_port_error;

mod message_producer;
mod transaction;

#[cfg(test)]
pub use message_producer::MockMessageProducer;
pub use message_producer::{MessageProducer, OutboundMessage, ProducerError};
pub use transaction::{
    Finalize, MessageAppender, Transaction, TransactionError, TransactionErrors, Transactor,
    finalize_attached,
};
