//! Reconciliation sweep.
//!
//! Pass 1 finishes reclamations that were interrupted after the unlink
//! committed (zero-reference rows). Pass 2 deletes blobs that no physical
//! row refers to, e.g. left behind by an upload that failed before commit.

use crate::error::VaultResult;
use crate::hooks::DeleteBlob;
use crate::reclaim::ReclaimCoordinator;
use futures::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use vault_core::config::SweepConfig;
use vault_core::digest::BLOB_KEY_PREFIX;
use vault_core::ContentDigest;
use vault_metadata::MetadataStore;
use vault_metadata::models::PhysicalFileRow;
use vault_storage::ObjectStore;

/// Counters from one sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub dry_run: bool,
    /// Zero-reference rows reclaimed (or that would be, in a dry run).
    pub rows_reclaimed: u64,
    pub bytes_reclaimed: u64,
    pub blobs_scanned: u64,
    /// Orphaned blobs deleted (or that would be, in a dry run).
    pub orphans_deleted: u64,
    pub orphan_bytes: u64,
    /// Orphan candidates younger than the grace period.
    pub skipped_recent: u64,
    /// Keys under the blob prefix that are not content-addressed blobs.
    pub skipped_foreign: u64,
    pub errors: u64,
}

enum OrphanResult {
    Kept,
    Deleted(u64),
    SkippedRecent,
    SkippedForeign,
    Error,
}

pub struct Sweeper {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    reclaimer: ReclaimCoordinator,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        reclaimer: ReclaimCoordinator,
        config: SweepConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            reclaimer,
            config,
        }
    }

    /// Run both passes.
    pub async fn run(&self) -> VaultResult<SweepStats> {
        let mut stats = SweepStats {
            dry_run: self.config.dry_run,
            ..SweepStats::default()
        };

        tracing::info!(
            dry_run = self.config.dry_run,
            grace_period_secs = self.config.grace_period_secs,
            batch_size = self.config.batch_size,
            "Starting reconciliation sweep"
        );

        self.finish_reclamations(&mut stats).await?;
        self.delete_orphans(&mut stats).await?;

        tracing::info!(?stats, "Reconciliation sweep finished");
        Ok(stats)
    }

    async fn finish_reclamations(&self, stats: &mut SweepStats) -> VaultResult<()> {
        // Rows that fail stay behind; the cursor moves past them.
        let mut cursor: Option<PhysicalFileRow> = None;

        loop {
            let batch = self
                .metadata
                .list_unreferenced_physical_files(cursor.as_ref(), self.config.batch_size)
                .await?;
            let Some(last) = batch.last().cloned() else {
                return Ok(());
            };
            let full_page = batch.len() >= self.config.batch_size as usize;

            for row in batch {
                if self.config.dry_run {
                    tracing::info!(
                        physical_file_id = %row.id,
                        digest = %row.digest,
                        size = row.size_bytes,
                        "DRY-RUN: Would reclaim unreferenced content"
                    );
                    stats.rows_reclaimed += 1;
                    stats.bytes_reclaimed += u64::try_from(row.size_bytes).unwrap_or(0);
                    continue;
                }

                match self.reclaimer.finalize(row.id).await {
                    Ok(Some(reclaimed)) => {
                        stats.rows_reclaimed += 1;
                        stats.bytes_reclaimed +=
                            u64::try_from(reclaimed.physical.size_bytes).unwrap_or(0);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            physical_file_id = %row.id,
                            digest = %row.digest,
                            error = %e,
                            "Failed to reclaim unreferenced content"
                        );
                        stats.errors += 1;
                    }
                }
            }

            if !full_page {
                return Ok(());
            }
            cursor = Some(last);
        }
    }

    async fn delete_orphans(&self, stats: &mut SweepStats) -> VaultResult<()> {
        let mut keys = self.storage.list_stream(BLOB_KEY_PREFIX).await?;
        while let Some(key) = keys.try_next().await? {
            stats.blobs_scanned += 1;
            match self.process_blob(&key).await {
                OrphanResult::Kept => {}
                OrphanResult::Deleted(size) => {
                    stats.orphans_deleted += 1;
                    stats.orphan_bytes += size;
                }
                OrphanResult::SkippedRecent => stats.skipped_recent += 1,
                OrphanResult::SkippedForeign => stats.skipped_foreign += 1,
                OrphanResult::Error => stats.errors += 1,
            }
        }
        Ok(())
    }

    async fn process_blob(&self, key: &str) -> OrphanResult {
        let digest = match ContentDigest::from_storage_key(key) {
            Ok(digest) => digest,
            Err(_) => {
                tracing::debug!(key = %key, "Not a content-addressed blob, skipping");
                return OrphanResult::SkippedForeign;
            }
        };

        match self.metadata.find_physical_file(&digest.to_hex()).await {
            Ok(Some(_)) => return OrphanResult::Kept,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to look up blob owner, skipping");
                return OrphanResult::Error;
            }
        }

        let meta = match self.storage.head(key).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return OrphanResult::Kept,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to stat orphan candidate");
                return OrphanResult::Error;
            }
        };

        // Without a timestamp the blob may belong to an upload in flight.
        let Some(last_modified) = meta.last_modified else {
            tracing::warn!(key = %key, "Orphan candidate has no modification time, keeping");
            return OrphanResult::SkippedRecent;
        };
        let age = OffsetDateTime::now_utc() - last_modified;
        if age < self.config.grace_period() {
            return OrphanResult::SkippedRecent;
        }

        if self.config.dry_run {
            tracing::info!(
                key = %key,
                size = meta.size,
                age_secs = age.whole_seconds(),
                "DRY-RUN: Would delete orphaned blob"
            );
            return OrphanResult::Deleted(meta.size);
        }

        tracing::info!(
            key = %key,
            size = meta.size,
            age_secs = age.whole_seconds(),
            "Deleting orphaned blob"
        );
        let release = DeleteBlob {
            storage: &self.storage,
        };
        match self
            .metadata
            .release_orphan_blob(&digest.to_hex(), key, &release)
            .await
        {
            Ok(true) => OrphanResult::Deleted(meta.size),
            Ok(false) => {
                tracing::debug!(key = %key, "Blob claimed by an upload, keeping");
                OrphanResult::Kept
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to delete orphaned blob");
                OrphanResult::Error
            }
        }
    }
}
