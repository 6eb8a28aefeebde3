//! Metadata store error types.

use thiserror::Error;

/// Error produced by a caller-supplied blob hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("blob operation failed inside transaction: {0}")]
    Hook(HookError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Database(sqlx::Error::Io(err))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Whether a database error is a unique constraint violation.
///
/// SQLite reports "UNIQUE constraint failed: table.column"; PostgreSQL uses
/// SQLSTATE 23505.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                || db_err.message().contains("UNIQUE constraint")
        }
        _ => false,
    }
}

/// Whether a database error is a foreign key violation.
///
/// SQLite reports "FOREIGN KEY constraint failed"; PostgreSQL uses SQLSTATE
/// 23503.
pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23503")
                || db_err.message().contains("FOREIGN KEY constraint")
        }
        _ => false,
    }
}
