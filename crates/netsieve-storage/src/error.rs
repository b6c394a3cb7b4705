//! Storage error types.

use netsieve_core::StoreError;
use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite rejected a statement or could not open the database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No row matched the requested key.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A rule value or other input was rejected before reaching SQL.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The database location could not be resolved or a connection lock was
    /// poisoned.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Lets [`crate::Database`] serve as the engine's rule and blob store.
///
/// Rejected input is reported as such; a stored row that no longer parses
/// is invalid data; everything else means the store is unavailable.
impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidInput(msg) => StoreError::Rejected(msg),
            StorageError::Database(rusqlite::Error::FromSqlConversionFailure(_, _, e)) => {
                StoreError::InvalidData(e.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
