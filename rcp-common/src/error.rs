//! Common error types for the response coding pipeline

use thiserror::Error;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across pipeline crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data access failure with operation context
    ///
    /// Surfaced for any query/update failure inside a pipeline operation.
    /// The unit of work in progress (one group, one batch) is rolled back,
    /// previously committed units are not.
    #[error("{operation} failed for workspace {workspace_id}: {source}")]
    DataAccess {
        operation: &'static str,
        workspace_id: i64,
        #[source]
        source: sqlx::Error,
    },

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected caller input, raised before any write
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Attach operation context to raw sqlx results
///
/// Logs the failure with its context before converting it into
/// [`Error::DataAccess`].
pub trait DbContext<T> {
    fn db_context(self, operation: &'static str, workspace_id: i64) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn db_context(self, operation: &'static str, workspace_id: i64) -> Result<T> {
        self.map_err(|source| {
            tracing::error!(
                operation,
                workspace_id,
                error = %source,
                "Data access failed"
            );
            Error::DataAccess {
                operation,
                workspace_id,
                source,
            }
        })
    }
}

impl<T> DbContext<T> for Result<T> {
    fn db_context(self, operation: &'static str, workspace_id: i64) -> Result<T> {
        match self {
            Err(Error::Database(source)) => {
                Err::<T, sqlx::Error>(source).db_context(operation, workspace_id)
            }
            other => other,
        }
    }
}
