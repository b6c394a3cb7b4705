//! Error types for the engine and its collaborators.

use thiserror::Error;

/// Errors reported by the engine's public configuration surface.
///
/// Nothing on the ingress path returns these; parse and collaborator
/// failures are recovered internally.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON parsing error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error while loading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by an external collaborator (rule store, blob store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or queried.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with data that could not be interpreted.
    #[error("Invalid store data: {0}")]
    InvalidData(String),

    /// The payload was rejected by the store.
    #[error("Store rejected payload: {0}")]
    Rejected(String),
}

/// Result type for engine configuration operations.
pub type Result<T> = std::result::Result<T, EngineError>;
