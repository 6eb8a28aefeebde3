//! Quota ledger: advisory checks and usage reporting.
//!
//! The authoritative increase and decrease happen inside the metadata
//! transactions that create or reclaim physical content
//! (`FileRepo::insert_new_content` and `FileRepo::reclaim_physical_file`).
//! This module only reads the ledger.

use crate::error::{VaultError, VaultResult};
use serde::Serialize;
use std::sync::Arc;
use vault_core::OwnerId;
use vault_metadata::MetadataStore;
use vault_metadata::models::UserRow;

/// Storage usage for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageReport {
    pub file_count: u64,
    /// Sum of sizes over the owner's files, duplicates counted each time.
    pub logical_bytes: u64,
    /// Sum of sizes over the distinct payloads the owner references.
    pub unique_bytes: u64,
    /// `logical_bytes - unique_bytes`.
    pub savings_bytes: u64,
    /// Savings as a percentage of logical bytes (0 when nothing is stored).
    pub savings_percent: f64,
    /// Bytes charged against the quota.
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

/// Read side of the per-user quota ledger.
#[derive(Clone)]
pub struct QuotaLedger {
    metadata: Arc<dyn MetadataStore>,
}

impl QuotaLedger {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Point-in-time check that `size` more bytes would fit.
    ///
    /// Used to reject obviously oversized uploads before any write. It does
    /// not reserve anything; the miss path re-checks atomically.
    pub async fn precheck(&self, owner: OwnerId, size: u64) -> VaultResult<UserRow> {
        let user = self.owner(owner).await?;
        let used = clamp(user.storage_used_bytes);
        let quota = clamp(user.storage_quota_bytes);
        if used.saturating_add(size) > quota {
            tracing::debug!(
                owner_id = %owner,
                size,
                used,
                quota,
                "Upload rejected by quota precheck"
            );
            return Err(VaultError::QuotaExceeded {
                requested: size,
                remaining: quota.saturating_sub(used),
            });
        }
        Ok(user)
    }

    /// Remaining bytes for an owner.
    pub async fn remaining(&self, owner: OwnerId) -> VaultResult<u64> {
        let user = self.owner(owner).await?;
        Ok(clamp(user.remaining_bytes()))
    }

    /// Usage figures combining the ledger with per-file statistics.
    pub async fn usage(&self, owner: OwnerId) -> VaultResult<UsageReport> {
        let user = self.owner(owner).await?;
        let summary = self.metadata.usage_summary(*owner.as_uuid()).await?;

        let logical_bytes = clamp(summary.logical_bytes);
        let unique_bytes = clamp(summary.unique_bytes);
        let savings_bytes = logical_bytes.saturating_sub(unique_bytes);
        let savings_percent = if logical_bytes == 0 {
            0.0
        } else {
            savings_bytes as f64 * 100.0 / logical_bytes as f64
        };

        Ok(UsageReport {
            file_count: clamp(summary.file_count),
            logical_bytes,
            unique_bytes,
            savings_bytes,
            savings_percent,
            used_bytes: clamp(user.storage_used_bytes),
            quota_bytes: clamp(user.storage_quota_bytes),
        })
    }

    async fn owner(&self, owner: OwnerId) -> VaultResult<UserRow> {
        self.metadata
            .get_user(*owner.as_uuid())
            .await?
            .ok_or(VaultError::UnknownOwner(owner))
    }
}

fn clamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
