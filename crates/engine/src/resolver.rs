//! Deduplication resolver.
//!
//! Turns validated content into a user file, either by linking to existing
//! physical content (hit) or by storing it for the first time (miss). The
//! digest's unique constraint decides which of several concurrent first
//! uploads creates the physical row; the losers retry as hits.

use crate::error::{BackendError, VaultError, VaultResult};
use crate::hooks::EnsureBlob;
use crate::ingest::IngestedContent;
use crate::quota::QuotaLedger;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;
use vault_core::{FileId, OwnerId};
use vault_metadata::models::{NewUserFile, PhysicalFileRow, UserFileRow};
use vault_metadata::repos::{LinkOutcome, PhysicalInsert};
use vault_metadata::{MetadataError, MetadataStore};
use vault_storage::ObjectStore;

/// Upper bound on lookup/insert/link rounds for one upload.
///
/// Each retry means another upload or a reclaim won a race on the same
/// digest; a handful of rounds is plenty.
pub const MAX_RESOLVE_ATTEMPTS: usize = 8;

/// Owner-supplied attributes of the user file being created.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub filename: String,
    pub description: Option<String>,
    /// Already normalized and sorted.
    pub tags: Vec<String>,
}

/// How a resolve finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Content was new and this upload stored it.
    Stored,
    /// Content already existed and was linked.
    Deduplicated,
}

#[derive(Clone)]
pub struct Resolver {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    quota: QuotaLedger,
}

impl Resolver {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        quota: QuotaLedger,
    ) -> Self {
        Self {
            metadata,
            storage,
            quota,
        }
    }

    /// Record `content` as a new user file of `owner`.
    pub async fn resolve(
        &self,
        owner: OwnerId,
        content: &IngestedContent,
        attributes: &FileAttributes,
    ) -> VaultResult<(UserFileRow, Resolution)> {
        let digest_hex = content.digest.to_hex();
        let storage_key = content.digest.storage_key();
        let now = OffsetDateTime::now_utc();

        let file = NewUserFile {
            id: *FileId::new().as_uuid(),
            owner_id: *owner.as_uuid(),
            filename: attributes.filename.clone(),
            media_type: content.detected_media_type.to_string(),
            description: attributes.description.clone(),
            tags: attributes.tags.clone(),
            created_at: now,
        };
        let ensure = EnsureBlob {
            storage: &self.storage,
            data: &content.bytes,
        };
        let mut blob_written = false;

        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            if let Some(existing) = self.metadata.find_physical_file(&digest_hex).await? {
                match self
                    .metadata
                    .link_existing_content(existing.id, &file, &ensure)
                    .await?
                {
                    LinkOutcome::Linked(row) => {
                        tracing::debug!(
                            owner_id = %owner,
                            file_id = %row.id,
                            digest = %digest_hex,
                            attempt,
                            "Dedup hit, linked existing content"
                        );
                        return Ok((row, Resolution::Deduplicated));
                    }
                    LinkOutcome::Vanished => {
                        tracing::debug!(
                            digest = %digest_hex,
                            attempt,
                            "Content reclaimed between lookup and link, retrying"
                        );
                        continue;
                    }
                }
            }

            if !blob_written {
                self.storage.put(&storage_key, content.bytes.clone()).await?;
                blob_written = true;
            }

            let physical = PhysicalFileRow {
                id: Uuid::new_v4(),
                digest: digest_hex.clone(),
                size_bytes: i64::try_from(content.size).map_err(|_| {
                    VaultError::InvalidInput("content size out of range".to_string())
                })?,
                storage_key: storage_key.clone(),
                media_type: content.detected_media_type.to_string(),
                reference_count: 1,
                origin_owner_id: Some(*owner.as_uuid()),
                last_unlinked_by: None,
                created_at: now,
            };

            match self
                .metadata
                .insert_new_content(&physical, &file, &ensure)
                .await
            {
                Ok(PhysicalInsert::Created(row)) => {
                    tracing::info!(
                        owner_id = %owner,
                        file_id = %row.id,
                        digest = %digest_hex,
                        size = content.size,
                        "Stored new content"
                    );
                    return Ok((row, Resolution::Stored));
                }
                Ok(PhysicalInsert::DigestTaken) => {
                    tracing::debug!(
                        digest = %digest_hex,
                        attempt,
                        "Lost digest insert race, retrying as hit"
                    );
                }
                Ok(PhysicalInsert::QuotaExceeded) => {
                    let remaining = self.quota.remaining(owner).await?;
                    return Err(VaultError::QuotaExceeded {
                        requested: content.size,
                        remaining,
                    });
                }
                Err(MetadataError::NotFound(_)) => return Err(VaultError::UnknownOwner(owner)),
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(
            owner_id = %owner,
            digest = %digest_hex,
            attempts = MAX_RESOLVE_ATTEMPTS,
            "Giving up on contended digest"
        );
        Err(BackendError::Contention(digest_hex).into())
    }
}
