//! User and quota ledger repository.

use crate::error::MetadataResult;
use crate::models::UserRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for users.
///
/// Quota usage is only ever changed inside the file repository's content
/// transactions; this repository covers provisioning and lookups.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Create a user. Fails with `AlreadyExists` when the name is taken.
    async fn create_user(&self, user: &UserRow) -> MetadataResult<()>;

    /// Get a user by ID.
    async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>>;

    /// Get a user by name.
    async fn get_user_by_name(&self, name: &str) -> MetadataResult<Option<UserRow>>;

    /// List all users ordered by name.
    async fn list_users(&self) -> MetadataResult<Vec<UserRow>>;

    /// Change a user's quota. Returns false if the user does not exist.
    ///
    /// Lowering a quota below current usage is allowed; further uploads of
    /// new content are then rejected until usage drops.
    async fn set_user_quota(&self, user_id: Uuid, quota_bytes: i64) -> MetadataResult<bool>;
}
