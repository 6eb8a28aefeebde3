//! Blob side effects run inside metadata transactions.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use vault_metadata::HookError;
use vault_metadata::repos::BlobHook;
use vault_storage::ObjectStore;

/// Makes sure a blob exists, writing `data` if it is missing.
///
/// Used when new content is recorded and when zero-reference content is
/// revived, so that a committed reference always has its blob.
pub(crate) struct EnsureBlob<'a> {
    pub storage: &'a Arc<dyn ObjectStore>,
    pub data: &'a Bytes,
}

#[async_trait]
impl BlobHook for EnsureBlob<'_> {
    async fn run(&self, storage_key: &str) -> Result<(), HookError> {
        if self.storage.exists(storage_key).await? {
            return Ok(());
        }
        tracing::debug!(key = %storage_key, "Blob missing, rewriting");
        self.storage.put(storage_key, self.data.clone()).await?;
        Ok(())
    }
}

/// Deletes a blob. A blob that is already gone counts as deleted.
pub(crate) struct DeleteBlob<'a> {
    pub storage: &'a Arc<dyn ObjectStore>,
}

#[async_trait]
impl BlobHook for DeleteBlob<'_> {
    async fn run(&self, storage_key: &str) -> Result<(), HookError> {
        match self.storage.delete(storage_key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(key = %storage_key, "Blob already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
