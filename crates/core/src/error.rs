//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid storage key: {0}")]
    InvalidStorageKey(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
