//! Coordination core: context, transaction ports and the composite.
//!
//! Purpose: let business logic open, commit or roll back a unit of work that
//! spans several backends without knowing which backends are involved. The
//! open transaction handles ride along in the request [`Context`]; adapter
//! clients discover them there.
//!
//! Public surface:
//! - [`Context`], [`ContextKey`], [`CompositeContext`]: request-scoped
//!   context tree with opaque keys.
//! - [`ports`]: `Transaction`, `Transactor`, `MessageProducer` and their
//!   errors.
//! - [`CompositeTransactor`]: concurrent fan-out over N transactors.
//! - [`run_in_transaction`]: begin/commit/rollback around a closure.

pub mod context;
pub mod ports;

mod composite;
mod unit_of_work;

pub use self::composite::{CompositeTransaction, CompositeTransactor, CompositeTransactorBuilder};
pub use self::context::{CancelHandle, CompositeContext, Context, ContextError, ContextKey};
pub use self::ports::{Transaction, TransactionError, Transactor};
pub use self::unit_of_work::run_in_transaction;
