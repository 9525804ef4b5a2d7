//! PostgreSQL relational adapter using Diesel ORM.
//!
//! Provides the relational implementation of the domain transaction ports,
//! backed by PostgreSQL via `diesel-async` and `bb8` connection pooling.
//!
//! # Architecture
//!
//! - [`PgTransactor`] opens read-committed, read-write transactions and
//!   stores the [`PgTransaction`] handle in the context under its key.
//! - [`PgExecutor`] is the client side: given a context, it writes through
//!   the open transaction or, when there is none, auto-commits on a pooled
//!   connection.
//! - Diesel and pool errors are mapped into [`PgExecutorError`] and
//!   `TransactionError` variants; nothing above this module sees Diesel
//!   types except the connection passed to executor operations.
//!
//! # Example
//!
//! ```ignore
//! use coordinator::outbound::persistence::{DbPool, PgTransactor, PoolConfig};
//!
//! let pool = DbPool::new(PoolConfig::new("postgres://localhost/mydb")).await?;
//! let transactor = PgTransactor::new(pool);
//! let executor = transactor.executor();
//! ```

mod error_mapping;
mod executor;
mod pg_transaction;
mod pool;

pub use error_mapping::PgExecutorError;
pub use executor::PgExecutor;
pub use pg_transaction::{BEGIN_SQL, PgTransaction, PgTransactor};
pub use pool::{DbPool, OwnedConnection, PoolConfig, PoolError};
