//! Reference-count and reclamation coordinator.

use crate::error::{VaultError, VaultResult};
use crate::hooks::DeleteBlob;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use vault_core::{FileId, OwnerId, ReclaimCredit};
use vault_metadata::MetadataStore;
use vault_metadata::repos::Reclaimed;
use vault_storage::ObjectStore;

/// Result of deleting a user file.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub file_id: FileId,
    pub filename: String,
    pub digest: String,
    /// References left on the physical content after this delete.
    pub remaining_references: u64,
    /// Whether the physical content and its blob were removed.
    pub reclaimed: bool,
    /// Bytes credited back to `credited_owner`.
    pub freed_bytes: u64,
    pub credited_owner: Option<OwnerId>,
    /// The unlink committed but reclaiming failed; the sweep will finish it.
    pub reclaim_deferred: bool,
}

#[derive(Clone)]
pub struct ReclaimCoordinator {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    credit: ReclaimCredit,
}

impl ReclaimCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        credit: ReclaimCredit,
    ) -> Self {
        Self {
            metadata,
            storage,
            credit,
        }
    }

    /// Delete `file_id` for `owner`, reclaiming its content if unreferenced.
    ///
    /// The unlink commits first. Reclaiming runs in its own transaction
    /// afterwards, so a failure there leaves a zero-reference row for the
    /// sweep rather than a user file pointing at a missing blob.
    pub async fn delete(&self, owner: OwnerId, file_id: FileId) -> VaultResult<DeleteOutcome> {
        let unlinked = self
            .metadata
            .unlink_user_file(*file_id.as_uuid(), *owner.as_uuid())
            .await?
            .ok_or(VaultError::NotFoundOrAccessDenied)?;

        let mut outcome = DeleteOutcome {
            file_id,
            filename: unlinked.filename,
            digest: unlinked.digest,
            remaining_references: u64::try_from(unlinked.reference_count).unwrap_or(0),
            reclaimed: false,
            freed_bytes: 0,
            credited_owner: None,
            reclaim_deferred: false,
        };

        if unlinked.reference_count > 0 {
            tracing::debug!(
                owner_id = %owner,
                file_id = %file_id,
                reference_count = unlinked.reference_count,
                "Unlinked shared content"
            );
            return Ok(outcome);
        }

        match self.finalize(unlinked.physical_file_id).await {
            Ok(Some(reclaimed)) => {
                outcome.reclaimed = true;
                outcome.freed_bytes = u64::try_from(reclaimed.physical.size_bytes).unwrap_or(0);
                outcome.credited_owner = reclaimed.credited_owner.map(OwnerId::from_uuid);
            }
            Ok(None) => {
                // Revived by a concurrent upload.
            }
            Err(e) => {
                tracing::warn!(
                    owner_id = %owner,
                    file_id = %file_id,
                    physical_file_id = %unlinked.physical_file_id,
                    error = %e,
                    "Reclaim failed after unlink; leaving it to the sweep"
                );
                outcome.reclaim_deferred = true;
            }
        }

        Ok(outcome)
    }

    /// Reclaim physical content if its reference count is still zero.
    ///
    /// Returns `None` when the row is gone or was revived in the meantime.
    pub async fn finalize(&self, physical_file_id: Uuid) -> VaultResult<Option<Reclaimed>> {
        let release = DeleteBlob {
            storage: &self.storage,
        };
        let reclaimed = self
            .metadata
            .reclaim_physical_file(physical_file_id, self.credit, &release)
            .await?;

        if let Some(r) = &reclaimed {
            tracing::info!(
                physical_file_id = %physical_file_id,
                digest = %r.physical.digest,
                size = r.physical.size_bytes,
                credited_owner = ?r.credited_owner,
                "Reclaimed unreferenced content"
            );
        }

        Ok(reclaimed)
    }
}
