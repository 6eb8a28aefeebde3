//! Activity log repository.

use crate::error::MetadataResult;
use crate::models::ActivityRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for activity records.
#[async_trait]
pub trait ActivityRepo: Send + Sync {
    /// Append an activity record.
    async fn record_activity(&self, activity: &ActivityRow) -> MetadataResult<()>;

    /// Most recent activity for an owner, newest first.
    async fn list_activity(&self, owner_id: Uuid, limit: u32) -> MetadataResult<Vec<ActivityRow>>;
}
