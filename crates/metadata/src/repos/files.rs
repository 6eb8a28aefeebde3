//! Physical content and user file repository.
//!
//! The composite operations here are the only places reference counts and
//! quota usage change. Each runs in a single metadata transaction.

use crate::error::{HookError, MetadataResult};
use crate::models::{NewUserFile, PhysicalFileRow, UsageSummary, UserFileRow};
use async_trait::async_trait;
use uuid::Uuid;
use vault_core::ReclaimCredit;

/// Maximum number of tags a single file may carry.
pub const MAX_TAGS: usize = vault_core::tag::MAX_TAGS_PER_FILE;

/// Columns selected for [`UserFileRow`], joined with its physical content.
pub(crate) const USER_FILE_SELECT: &str = "SELECT u.id, u.owner_id, u.physical_file_id, \
     u.filename, u.media_type, u.description, u.tags, u.created_at, \
     p.digest, p.size_bytes, p.storage_key \
     FROM user_files u JOIN physical_files p ON p.id = u.physical_file_id";

/// Blob side effect run while a metadata transaction holds its row lock.
///
/// A hook failure rolls the transaction back.
#[async_trait]
pub trait BlobHook: Send + Sync {
    async fn run(&self, storage_key: &str) -> Result<(), HookError>;
}

/// Outcome of inserting brand new physical content.
#[derive(Debug)]
pub enum PhysicalInsert {
    /// Physical row, quota charge and user file were committed together.
    Created(UserFileRow),
    /// Another upload inserted the same digest first. Nothing was written.
    DigestTaken,
    /// The owner's remaining quota cannot cover the content. Nothing was written.
    QuotaExceeded,
}

/// Outcome of linking a user file to existing physical content.
#[derive(Debug)]
pub enum LinkOutcome {
    Linked(UserFileRow),
    /// The physical row was reclaimed between lookup and increment.
    Vanished,
}

/// Result of removing a user file.
#[derive(Debug, Clone)]
pub struct Unlinked {
    pub file_id: Uuid,
    pub filename: String,
    pub physical_file_id: Uuid,
    pub digest: String,
    pub size_bytes: i64,
    /// Reference count after the decrement.
    pub reference_count: i64,
}

/// Result of reclaiming physical content.
#[derive(Debug, Clone)]
pub struct Reclaimed {
    /// The deleted row as it was at deletion time.
    pub physical: PhysicalFileRow,
    /// Owner whose usage was credited, if any.
    pub credited_owner: Option<Uuid>,
}

/// Repository for physical content and user files.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Look up physical content by digest (lowercase hex).
    async fn find_physical_file(&self, digest: &str) -> MetadataResult<Option<PhysicalFileRow>>;

    /// Get physical content by ID.
    async fn get_physical_file(&self, id: Uuid) -> MetadataResult<Option<PhysicalFileRow>>;

    /// Store metadata for content seen for the first time.
    ///
    /// In one transaction: insert `physical` with a reference count of 1,
    /// charge its size to `file.owner_id` only if it fits the quota, insert
    /// the user file, then run `ensure` before commit. The blob should
    /// already be written; `ensure` confirms it survived a reclaim of the
    /// same digest that committed while this transaction waited.
    async fn insert_new_content(
        &self,
        physical: &PhysicalFileRow,
        file: &NewUserFile,
        ensure: &dyn BlobHook,
    ) -> MetadataResult<PhysicalInsert>;

    /// Link a new user file to existing physical content.
    ///
    /// In one transaction: atomically increment the reference count and
    /// insert the user file. When the increment revives a row whose count had
    /// dropped to zero, `revive` runs before commit so the blob is guaranteed
    /// to exist again. No quota change.
    async fn link_existing_content(
        &self,
        physical_file_id: Uuid,
        file: &NewUserFile,
        revive: &dyn BlobHook,
    ) -> MetadataResult<LinkOutcome>;

    /// Delete a user file owned by `owner_id` and decrement its content's
    /// reference count, recording `owner_id` as the last unlinker.
    ///
    /// Returns `None` when the file does not exist or belongs to someone else.
    async fn unlink_user_file(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
    ) -> MetadataResult<Option<Unlinked>>;

    /// Reclaim physical content whose reference count is zero.
    ///
    /// In one transaction: delete the row only if its count is still zero,
    /// run `release` to delete the blob, credit the size back to the owner
    /// chosen by `credit`, and commit. Returns `None` when the row is gone or
    /// was revived. A `release` failure rolls back and leaves the row.
    async fn reclaim_physical_file(
        &self,
        physical_file_id: Uuid,
        credit: ReclaimCredit,
        release: &dyn BlobHook,
    ) -> MetadataResult<Option<Reclaimed>>;

    /// Delete a blob that no physical row refers to.
    ///
    /// In one transaction: claim `digest` with a zero-reference placeholder
    /// row, run `release`, drop the placeholder and commit. A first upload of
    /// the same digest waits on the claim, then finds the blob gone and its
    /// `ensure` hook writes it again. Returns `false` without running
    /// `release` when content for the digest is already recorded.
    async fn release_orphan_blob(
        &self,
        digest: &str,
        storage_key: &str,
        release: &dyn BlobHook,
    ) -> MetadataResult<bool>;

    /// Physical rows with a zero reference count, oldest first.
    ///
    /// Rows are ordered by `(created_at, id)`; pass the last row of the
    /// previous page as `after` to continue past it.
    async fn list_unreferenced_physical_files(
        &self,
        after: Option<&PhysicalFileRow>,
        limit: u32,
    ) -> MetadataResult<Vec<PhysicalFileRow>>;

    /// Get a user file if it exists and belongs to `owner_id`.
    async fn get_user_file(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
    ) -> MetadataResult<Option<UserFileRow>>;

    /// All of an owner's files, newest first.
    async fn list_user_files(&self, owner_id: Uuid) -> MetadataResult<Vec<UserFileRow>>;

    /// Add a tag to an owned file. Adding a present tag is a no-op.
    ///
    /// Fails with `Constraint` when the file already has `MAX_TAGS` tags.
    async fn add_tag(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
        tag: &str,
    ) -> MetadataResult<Option<UserFileRow>>;

    /// Remove a tag from an owned file. Removing an absent tag is a no-op.
    async fn remove_tag(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
        tag: &str,
    ) -> MetadataResult<Option<UserFileRow>>;

    /// Usage figures for an owner.
    async fn usage_summary(&self, owner_id: Uuid) -> MetadataResult<UsageSummary>;
}

/// Apply a tag edit to a sorted tag list. Returns false when nothing changed.
pub(crate) fn edit_tags(tags: &mut Vec<String>, tag: &str, add: bool) -> MetadataResult<bool> {
    match (tags.binary_search_by(|t| t.as_str().cmp(tag)), add) {
        (Ok(_), true) | (Err(_), false) => Ok(false),
        (Err(pos), true) => {
            if tags.len() >= MAX_TAGS {
                return Err(crate::error::MetadataError::Constraint(format!(
                    "a file may carry at most {MAX_TAGS} tags"
                )));
            }
            tags.insert(pos, tag.to_string());
            Ok(true)
        }
        (Ok(pos), false) => {
            tags.remove(pos);
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_tags_keeps_order_and_set_semantics() {
        let mut tags = vec!["b".to_string()];
        assert!(edit_tags(&mut tags, "a", true).unwrap());
        assert!(edit_tags(&mut tags, "c", true).unwrap());
        assert!(!edit_tags(&mut tags, "a", true).unwrap());
        assert_eq!(tags, vec!["a", "b", "c"]);

        assert!(edit_tags(&mut tags, "b", false).unwrap());
        assert!(!edit_tags(&mut tags, "zzz", false).unwrap());
        assert_eq!(tags, vec!["a", "c"]);
    }

    #[test]
    fn test_edit_tags_limit() {
        let mut tags: Vec<String> = (0..MAX_TAGS).map(|i| format!("t{i:03}")).collect();
        assert!(edit_tags(&mut tags, "zz", true).is_err());
        // Re-adding an existing tag at the limit is still a no-op.
        assert!(!edit_tags(&mut tags, "t000", true).unwrap());
    }
}
