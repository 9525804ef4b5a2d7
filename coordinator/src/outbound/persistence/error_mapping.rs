//! Diesel and pool error mapping shared by the relational adapter.

use tracing::debug;

use crate::domain::{ContextError, TransactionError};

use super::pool::PoolError;

/// Errors surfaced by [`super::PgExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PgExecutorError {
    /// The enclosing transaction is closed or belongs to another backend.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// The context was cancelled or expired before the operation ran.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Connection checkout or connectivity failure.
    #[error("postgres connection failed: {message}")]
    Connection { message: String },
    /// The query was rejected or failed while executing.
    #[error("postgres query failed: {message}")]
    Query { message: String },
    /// A single-row read matched nothing.
    #[error("record not found")]
    NotFound,
}

impl PgExecutorError {
    /// Create a connection error with the given message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a query error with the given message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }
}

/// Map pool checkout failures to connection errors.
pub(crate) fn map_pool_error(error: PoolError) -> PgExecutorError {
    PgExecutorError::connection(error.message())
}

/// Extract a readable message from a Diesel error and emit debug context.
pub(crate) fn diesel_error_message(error: &diesel::result::Error, operation: &str) -> String {
    let error_message = error.to_string();
    debug!(%error_message, %operation, "diesel operation failed");
    error_message
}

/// Map Diesel errors raised by executor operations.
pub(crate) fn map_diesel_error(error: diesel::result::Error) -> PgExecutorError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    match &error {
        DieselError::DatabaseError(kind, info) => {
            debug!(?kind, message = info.message(), "diesel operation failed");
        }
        _ => debug!(
            error_type = %std::any::type_name_of_val(&error),
            "diesel operation failed"
        ),
    }

    match error {
        DieselError::NotFound => PgExecutorError::NotFound,
        DieselError::QueryBuilderError(_) => PgExecutorError::query("database query error"),
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            PgExecutorError::connection("database connection error")
        }
        DieselError::DatabaseError(_, info) => PgExecutorError::query(info.message()),
        DieselError::BrokenTransactionManager => {
            PgExecutorError::connection("transaction manager is broken")
        }
        other => PgExecutorError::query(other.to_string()),
    }
}
