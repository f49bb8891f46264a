//! Error types for modeldb.
//!
//! This module defines all error types using `thiserror`. The variants are
//! grouped into four kinds (see [`ErrorKind`]): configuration, compilation,
//! execution and resource errors. None of them is retried by the library.

use crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message} (key: {key})")]
    Configuration { key: String, message: String },

    #[error("Compilation failed: {message}")]
    Compilation { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout {
        operation: String,
        elapsed_ms: u64,
    },

    #[error("Resource error: {message}")]
    Resource { message: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No connection provider could be resolved.
    Configuration,
    /// The compiler rejected a structured query.
    Compilation,
    /// The driver failed to run a statement or to reach the database.
    Execution,
    /// A prepared statement or cursor could not be released.
    Resource,
}

impl DbError {
    /// Create a configuration error naming the registration that is missing.
    pub fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a compilation error.
    pub fn compilation(message: impl Into<String>) -> Self {
        Self::Compilation {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a resource release error.
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Compilation { .. } => ErrorKind::Compilation,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::Connection { .. }
            | Self::Database { .. }
            | Self::Timeout { .. }
            | Self::Transaction { .. }
            | Self::InvalidInput { .. }
            | Self::Internal { .. } => ErrorKind::Execution,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is transient. Informational only: modeldb never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax, constraints and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout(
                "connection pool acquire",
                Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
