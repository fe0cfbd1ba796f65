//! Error types for the conversation event log.

/// Errors that can occur during event log operations.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// A database operation failed.
    #[error("observe database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A pooled connection could not be acquired.
    #[error("observe pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization or deserialization failed.
    #[error("observe serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking database task panicked or was cancelled.
    #[error("observe background task failed: {0}")]
    Task(String),

    /// A stored row carried a source tag this build does not know.
    #[error("observe row has unknown source tag: {0}")]
    UnknownSource(String),
}
