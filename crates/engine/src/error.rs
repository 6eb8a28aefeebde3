//! Engine error taxonomy.

use thiserror::Error;
use vault_core::OwnerId;
use vault_metadata::MetadataError;
use vault_storage::StorageError;

/// Errors surfaced by vault operations.
///
/// Only [`VaultError::Backend`] and [`VaultError::Read`] are worth retrying;
/// every other variant is terminal for the given input.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("content type mismatch: declared {declared}, detected {detected}")]
    ContentTypeMismatch { declared: String, detected: String },

    #[error("quota exceeded: {requested} bytes requested, {remaining} bytes remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },

    #[error("payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("unknown owner: {0}")]
    UnknownOwner(OwnerId),

    #[error("file not found or access denied")]
    NotFoundOrAccessDenied,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to read upload stream: {0}")]
    Read(#[source] std::io::Error),

    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),
}

/// Failure of the blob store or metadata store.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata: {0}")]
    Metadata(#[from] MetadataError),

    /// Stored data that does not parse, e.g. a malformed digest column.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The dedup resolver kept losing races and gave up.
    #[error("too much contention on digest {0}")]
    Contention(String),
}

impl VaultError {
    /// Whether repeating the same call from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Read(_))
    }

    /// Stable short code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContentTypeMismatch { .. } => "content_type_mismatch",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UnknownOwner(_) => "unknown_owner",
            Self::NotFoundOrAccessDenied => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Read(_) => "read_error",
            Self::Backend(_) => "backend_failure",
        }
    }
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        Self::Backend(BackendError::Storage(err))
    }
}

impl From<MetadataError> for VaultError {
    fn from(err: MetadataError) -> Self {
        Self::Backend(BackendError::Metadata(err))
    }
}

impl From<vault_core::Error> for VaultError {
    fn from(err: vault_core::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

/// Result type for vault operations.
pub type VaultResult<T> = std::result::Result<T, VaultError>;
