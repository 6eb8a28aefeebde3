//! Deduplicating storage engine for the vault.
//!
//! Uploads are read once, hashed and sniffed ([`ingest`]), then either linked
//! to existing physical content or stored for the first time ([`resolver`]).
//! Deletes unlink first and reclaim unreferenced content in a second
//! transaction ([`reclaim`]). [`sweep`] repairs whatever a crash between those
//! steps leaves behind. [`Vault`] ties it together behind an explicit
//! [`RequestContext`](vault_core::RequestContext).

pub mod activity;
pub mod error;
mod hooks;
pub mod ingest;
pub mod quota;
pub mod reclaim;
pub mod resolver;
pub mod sweep;
pub mod vault;

pub use error::{BackendError, VaultError, VaultResult};
pub use quota::UsageReport;
pub use reclaim::DeleteOutcome;
pub use sweep::SweepStats;
pub use vault::{
    Download, FileRecord, HealthReport, UploadOutcome, UploadRequest, Vault,
};
