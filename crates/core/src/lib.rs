//! Core domain types for the deduplicating file vault.
//!
//! This crate defines the data model shared by all other crates:
//! - Content digests and the blob storage keys derived from them
//! - Media type sniffing and declared-type comparison
//! - Owner and file identifiers
//! - The explicit per-request context
//! - Tag normalization
//! - Configuration

pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod ids;
pub mod media;
pub mod tag;

pub use config::{ReclaimCredit, VaultConfig};
pub use context::{RequestContext, TraceId};
pub use digest::{ContentDigest, DigestHasher};
pub use error::{Error, Result};
pub use ids::{FileId, OwnerId};

/// Default maximum upload size: 100 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Default per-user quota: 10 MiB
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024;
