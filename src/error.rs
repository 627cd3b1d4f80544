//! Error types for the database bridge.
//!
//! Every public operation either succeeds or fails with exactly one `DbError`.
//! Resource failures are never retried automatically and never swallowed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Factory or network failure while establishing a connection.
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// No handle became available within the caller's deadline.
    #[error("Connection pool exhausted: no handle available within {waited_ms}ms (max_size: {max_size})")]
    PoolExhausted { max_size: usize, waited_ms: u64 },

    /// Parameter count or shape does not match the command text.
    #[error("Binding error: {message}")]
    Binding { message: String },

    /// Operation attempted on a statement or stream that is already closed.
    #[error("Statement is closed: {operation}")]
    StatementClosed { operation: String },

    /// Remote failure during execute, fetch, commit or rollback.
    #[error("Execution failed during {operation}: {message}")]
    Execution { operation: String, message: String },

    /// The transaction could not be committed; `cause` is the triggering failure.
    #[error("Transaction aborted: {cause}")]
    TransactionAborted {
        #[source]
        cause: Box<DbError>,
    },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Programming error in how the API was driven.
    #[error("Invalid usage: {message}")]
    Usage { message: String },
}

/// Coarse classification of a `DbError`, useful for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    PoolExhausted,
    Binding,
    StatementClosed,
    Execution,
    TransactionAborted,
    Config,
    Usage,
}

impl DbError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a pool exhaustion error.
    pub fn pool_exhausted(max_size: usize, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            max_size,
            waited_ms,
        }
    }

    /// Create a binding error.
    pub fn binding(message: impl Into<String>) -> Self {
        Self::Binding {
            message: message.into(),
        }
    }

    /// Create a statement closed error.
    pub fn statement_closed(operation: impl Into<String>) -> Self {
        Self::StatementClosed {
            operation: operation.into(),
        }
    }

    /// Create an execution error.
    pub fn execution(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap the failure that aborted a transaction.
    pub fn transaction_aborted(cause: DbError) -> Self {
        Self::TransactionAborted {
            cause: Box::new(cause),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Binding { .. } => ErrorKind::Binding,
            Self::StatementClosed { .. } => ErrorKind::StatementClosed,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::TransactionAborted { .. } => ErrorKind::TransactionAborted,
            Self::Config { .. } => ErrorKind::Config,
            Self::Usage { .. } => ErrorKind::Usage,
        }
    }

    /// The failure that triggered a rollback, if this is a `TransactionAborted`.
    pub fn aborted_cause(&self) -> Option<&DbError> {
        match self {
            Self::TransactionAborted { cause } => Some(cause),
            _ => None,
        }
    }

    /// Check if the caller may reasonably retry the operation.
    ///
    /// Nothing here retries on its own; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::PoolExhausted { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(msg.to_string()),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(format!("TLS error: {}", tls_err)),
            sqlx::Error::PoolClosed => DbError::connection("Driver pool is closed"),
            sqlx::Error::Database(db_err) => {
                let message = match db_err.code() {
                    Some(code) => format!("{} (code: {})", db_err.message(), code),
                    None => db_err.message().to_string(),
                };
                DbError::execution("execute", message)
            }
            sqlx::Error::ColumnDecode { index, source } => DbError::execution(
                "fetch",
                format!("Failed to decode column {}: {}", index, source),
            ),
            sqlx::Error::Decode(source) => {
                DbError::execution("fetch", format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => DbError::connection("Database worker crashed"),
            other => DbError::execution("execute", other.to_string()),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
