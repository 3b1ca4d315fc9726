//! Error types for the persistence layer.

use thiserror::Error;

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors that can occur while provisioning or using a tenant.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Pool construction or checkout failed.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// IO error (database directory creation).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No DDL could be found for a declared entity.
    #[error("no schema found for entity `{entity}` of module `{module}`")]
    UnknownEntity { module: String, entity: String },

    /// The entity's DDL failed to apply.
    #[error("schema for entity `{entity}` failed: {message}")]
    Schema { entity: String, message: String },
}
