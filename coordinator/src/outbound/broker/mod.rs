//! Message broker adapter.
//!
//! Brokers take part in composite units of work through a buffered
//! pseudo-transaction: [`BufferedTransactor`] opens a [`BufferedTransaction`]
//! that collects messages published by [`Publisher`] and flushes them as one
//! batch on commit. [`ProducerRegistry`] owns the named producer clients and
//! their shutdown.

mod buffered_transaction;
mod publisher;
mod registry;

pub use buffered_transaction::{BufferedTransaction, BufferedTransactor};
pub use publisher::{Delivery, PublishError, Publisher};
pub use registry::{ProducerRegistry, RegistryError};
