//! The `Vault` facade: every externally visible operation.

use crate::activity::{
    ActivityAction, ActivityEvent, ActivityQueue, ActivitySink, MetadataSink, TracingSink,
};
use crate::error::{BackendError, VaultError, VaultResult};
use crate::ingest::IngestPipeline;
use crate::quota::{QuotaLedger, UsageReport};
use crate::reclaim::{DeleteOutcome, ReclaimCoordinator};
use crate::resolver::{FileAttributes, Resolution, Resolver};
use crate::sweep::{SweepStats, Sweeper};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncRead;
use vault_core::config::{ActivitySinkKind, SweepConfig};
use vault_core::{ContentDigest, FileId, OwnerId, RequestContext, VaultConfig, tag};
use vault_metadata::models::{ActivityRow, UserFileRow, UserRow};
use vault_metadata::{MetadataError, MetadataStore};
use vault_storage::{ByteStream, ObjectStore};

/// Maximum filename length in characters.
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum user name length in characters.
pub const MAX_USER_NAME_LEN: usize = 64;

/// Upload parameters supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub filename: String,
    /// Media type claimed by the client. Empty means `application/octet-stream`.
    pub declared_media_type: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// An owner-visible file.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub owner_id: OwnerId,
    pub filename: String,
    /// Detected media type.
    pub media_type: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub size: u64,
    /// Lowercase hex SHA-256.
    pub digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FileRecord {
    fn from_row(row: UserFileRow) -> VaultResult<Self> {
        // Reject rows whose digest would not address a blob.
        ContentDigest::from_hex(&row.digest).map_err(|e| {
            VaultError::Backend(BackendError::Corrupt(format!("file {}: {e}", row.id)))
        })?;
        Ok(Self {
            id: FileId::from_uuid(row.id),
            owner_id: OwnerId::from_uuid(row.owner_id),
            filename: row.filename,
            media_type: row.media_type,
            description: row.description,
            tags: row.tags.0,
            size: u64::try_from(row.size_bytes).unwrap_or(0),
            digest: row.digest,
            created_at: row.created_at,
        })
    }
}

/// Result of an upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub file: FileRecord,
    /// True when the content was already stored and only linked.
    pub deduplicated: bool,
}

/// A file being downloaded.
pub struct Download {
    pub file: FileRecord,
    pub stream: ByteStream,
}

/// Health of one backing store.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub backend: &'static str,
    pub error: Option<String>,
}

/// Health of both backing stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub metadata: ComponentHealth,
    pub storage: ComponentHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.metadata.error.is_none() && self.storage.error.is_none()
    }
}

/// Content-addressed, deduplicating file vault.
pub struct Vault {
    config: VaultConfig,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    ingest: IngestPipeline,
    resolver: Resolver,
    reclaimer: ReclaimCoordinator,
    quota: QuotaLedger,
    activity: ActivityQueue,
}

impl Vault {
    /// Build a vault over existing stores.
    ///
    /// Must be called from within a Tokio runtime when activity logging is
    /// enabled, since it spawns the activity worker.
    pub fn new(
        config: VaultConfig,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        let quota = QuotaLedger::new(metadata.clone());
        let ingest = IngestPipeline::new(quota.clone(), config.ingest.max_upload_bytes);
        let resolver = Resolver::new(metadata.clone(), storage.clone(), quota.clone());
        let reclaimer =
            ReclaimCoordinator::new(metadata.clone(), storage.clone(), config.quota.reclaim_credit);

        let activity = if config.activity.enabled {
            let sink: Arc<dyn ActivitySink> = match config.activity.sink {
                ActivitySinkKind::Metadata => Arc::new(MetadataSink::new(metadata.clone())),
                ActivitySinkKind::Tracing => Arc::new(TracingSink),
            };
            ActivityQueue::spawn(config.activity.queue_capacity, sink)
        } else {
            ActivityQueue::disabled()
        };

        tracing::debug!(
            metadata = metadata.backend_name(),
            storage = storage.backend_name(),
            reclaim_credit = ?config.quota.reclaim_credit,
            "Vault initialized"
        );

        Self {
            config,
            metadata,
            storage,
            ingest,
            resolver,
            reclaimer,
            quota,
            activity,
        }
    }

    /// Validate `config`, open both stores and build a vault.
    pub async fn from_config(config: VaultConfig) -> VaultResult<Self> {
        config.validate().map_err(VaultError::InvalidInput)?;
        let storage = vault_storage::from_config(&config.storage).await?;
        let metadata = vault_metadata::from_config(&config.metadata).await?;
        Ok(Self::new(config, metadata, storage))
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStore> {
        &self.storage
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Provision a user. `quota_bytes` defaults to `quota.default_quota_bytes`.
    pub async fn create_user(&self, name: &str, quota_bytes: Option<u64>) -> VaultResult<UserRow> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_USER_NAME_LEN {
            return Err(VaultError::InvalidInput(format!(
                "user name must be 1 to {MAX_USER_NAME_LEN} characters"
            )));
        }
        let quota = quota_bytes.unwrap_or(self.config.quota.default_quota_bytes);
        let user = UserRow {
            id: *OwnerId::new().as_uuid(),
            name: name.to_string(),
            storage_used_bytes: 0,
            storage_quota_bytes: to_i64(quota)?,
            created_at: OffsetDateTime::now_utc(),
        };

        match self.metadata.create_user(&user).await {
            Ok(()) => {
                tracing::info!(owner_id = %user.id, name = %user.name, quota, "Created user");
                Ok(user)
            }
            Err(MetadataError::AlreadyExists(_)) => Err(VaultError::InvalidInput(format!(
                "user name already taken: {name}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_user(&self, name: &str) -> VaultResult<Option<UserRow>> {
        Ok(self.metadata.get_user_by_name(name.trim()).await?)
    }

    pub async fn list_users(&self) -> VaultResult<Vec<UserRow>> {
        Ok(self.metadata.list_users().await?)
    }

    /// Change an owner's quota.
    pub async fn set_quota(&self, owner: OwnerId, quota_bytes: u64) -> VaultResult<()> {
        if self
            .metadata
            .set_user_quota(*owner.as_uuid(), to_i64(quota_bytes)?)
            .await?
        {
            Ok(())
        } else {
            Err(VaultError::UnknownOwner(owner))
        }
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Store the content of `reader` as a new file of the calling owner.
    #[tracing::instrument(
        skip(self, ctx, reader, request),
        fields(owner_id = %ctx.owner_id, trace_id = %ctx.trace_id)
    )]
    pub async fn upload<R>(
        &self,
        ctx: &RequestContext,
        reader: R,
        request: UploadRequest,
    ) -> VaultResult<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let filename = validate_filename(&request.filename)?;
        let tags: Vec<String> = tag::normalize_tags(&request.tags)?.into_iter().collect();
        let description = request
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let content = self
            .ingest
            .ingest(ctx.owner_id, reader, &request.declared_media_type)
            .await?;

        let attributes = FileAttributes {
            filename,
            description,
            tags,
        };
        let (row, resolution) = self
            .resolver
            .resolve(ctx.owner_id, &content, &attributes)
            .await?;
        let file = FileRecord::from_row(row)?;

        self.activity.emit(
            ActivityEvent::new(ctx, ActivityAction::Upload, Some(file.id))
                .with_detail(file.filename.clone()),
        );

        Ok(UploadOutcome {
            file,
            deduplicated: resolution == Resolution::Deduplicated,
        })
    }

    /// Open a file of the calling owner for reading.
    pub async fn download(&self, ctx: &RequestContext, file_id: FileId) -> VaultResult<Download> {
        let file = self.get_file(ctx, file_id).await?;
        let key = ContentDigest::from_hex(&file.digest)
            .map_err(|e| BackendError::Corrupt(e.to_string()))?
            .storage_key();

        let stream = match self.storage.get_stream(&key).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    owner_id = %ctx.owner_id,
                    file_id = %file_id,
                    key = %key,
                    error = %e,
                    "Referenced blob unreadable"
                );
                return Err(e.into());
            }
        };

        self.activity
            .emit(ActivityEvent::new(ctx, ActivityAction::Download, Some(file_id)));

        Ok(Download { file, stream })
    }

    /// Delete a file of the calling owner.
    pub async fn delete(&self, ctx: &RequestContext, file_id: FileId) -> VaultResult<DeleteOutcome> {
        let outcome = self.reclaimer.delete(ctx.owner_id, file_id).await?;
        self.activity.emit(
            ActivityEvent::new(ctx, ActivityAction::Delete, Some(file_id))
                .with_detail(outcome.filename.clone()),
        );
        Ok(outcome)
    }

    /// The calling owner's files, newest first.
    pub async fn list_files(&self, ctx: &RequestContext) -> VaultResult<Vec<FileRecord>> {
        self.metadata
            .list_user_files(*ctx.owner_id.as_uuid())
            .await?
            .into_iter()
            .map(FileRecord::from_row)
            .collect()
    }

    pub async fn get_file(&self, ctx: &RequestContext, file_id: FileId) -> VaultResult<FileRecord> {
        let row = self
            .metadata
            .get_user_file(*file_id.as_uuid(), *ctx.owner_id.as_uuid())
            .await?
            .ok_or(VaultError::NotFoundOrAccessDenied)?;
        FileRecord::from_row(row)
    }

    pub async fn add_tag(
        &self,
        ctx: &RequestContext,
        file_id: FileId,
        tag: &str,
    ) -> VaultResult<FileRecord> {
        self.edit_tag(ctx, file_id, tag, ActivityAction::TagAdd).await
    }

    pub async fn remove_tag(
        &self,
        ctx: &RequestContext,
        file_id: FileId,
        tag: &str,
    ) -> VaultResult<FileRecord> {
        self.edit_tag(ctx, file_id, tag, ActivityAction::TagRemove)
            .await
    }

    async fn edit_tag(
        &self,
        ctx: &RequestContext,
        file_id: FileId,
        raw: &str,
        action: ActivityAction,
    ) -> VaultResult<FileRecord> {
        let tag = tag::normalize_tag(raw)?;
        let (file, owner) = (*file_id.as_uuid(), *ctx.owner_id.as_uuid());
        let result = match action {
            ActivityAction::TagAdd => self.metadata.add_tag(file, owner, &tag).await,
            _ => self.metadata.remove_tag(file, owner, &tag).await,
        };
        let row = match result {
            Ok(row) => row.ok_or(VaultError::NotFoundOrAccessDenied)?,
            Err(MetadataError::Constraint(msg)) => return Err(VaultError::InvalidInput(msg)),
            Err(e) => return Err(e.into()),
        };

        self.activity
            .emit(ActivityEvent::new(ctx, action, Some(file_id)).with_detail(tag));
        FileRecord::from_row(row)
    }

    // =========================================================================
    // Accounting and maintenance
    // =========================================================================

    pub async fn usage(&self, ctx: &RequestContext) -> VaultResult<UsageReport> {
        self.quota.usage(ctx.owner_id).await
    }

    /// Most recent activity of the calling owner.
    pub async fn activity(&self, ctx: &RequestContext, limit: u32) -> VaultResult<Vec<ActivityRow>> {
        Ok(self
            .metadata
            .list_activity(*ctx.owner_id.as_uuid(), limit)
            .await?)
    }

    /// Run the reconciliation sweep with the configured settings.
    pub async fn sweep(&self) -> VaultResult<SweepStats> {
        self.sweep_with(self.config.sweep.clone()).await
    }

    pub async fn sweep_with(&self, config: SweepConfig) -> VaultResult<SweepStats> {
        config.validate().map_err(VaultError::InvalidInput)?;
        Sweeper::new(
            self.metadata.clone(),
            self.storage.clone(),
            self.reclaimer.clone(),
            config,
        )
        .run()
        .await
    }

    /// Probe both backing stores.
    pub async fn health_check(&self) -> HealthReport {
        let metadata = ComponentHealth {
            backend: self.metadata.backend_name(),
            error: self.metadata.health_check().await.err().map(|e| e.to_string()),
        };
        let storage = ComponentHealth {
            backend: self.storage.backend_name(),
            error: self.storage.health_check().await.err().map(|e| e.to_string()),
        };
        HealthReport { metadata, storage }
    }

    /// Flush queued activity events and stop the activity worker.
    pub async fn shutdown(mut self) {
        self.activity.close().await;
    }
}

fn validate_filename(raw: &str) -> VaultResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(VaultError::InvalidInput("filename cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_FILENAME_LEN {
        return Err(VaultError::InvalidInput(format!(
            "filename exceeds {MAX_FILENAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(VaultError::InvalidInput(
            "filename contains control characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn to_i64(value: u64) -> VaultResult<i64> {
    i64::try_from(value).map_err(|_| VaultError::InvalidInput(format!("{value} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert_eq!(validate_filename("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_filename("   ").is_err());
        assert!(validate_filename("a\nb").is_err());
        assert!(validate_filename(&"x".repeat(MAX_FILENAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_to_i64_range() {
        assert_eq!(to_i64(5).unwrap(), 5);
        assert!(to_i64(u64::MAX).is_err());
    }
}
