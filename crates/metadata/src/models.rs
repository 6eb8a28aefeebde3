//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Users and quota
// =============================================================================

/// User record carrying the quota ledger.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    /// Bytes of physical content charged to this user.
    pub storage_used_bytes: i64,
    pub storage_quota_bytes: i64,
    pub created_at: OffsetDateTime,
}

impl UserRow {
    /// Bytes still available under the quota (never negative).
    pub fn remaining_bytes(&self) -> i64 {
        (self.storage_quota_bytes - self.storage_used_bytes).max(0)
    }
}

// =============================================================================
// Physical content
// =============================================================================

/// One distinct payload, stored once per digest.
#[derive(Debug, Clone, FromRow)]
pub struct PhysicalFileRow {
    pub id: Uuid,
    /// Lowercase hex SHA-256 of the content.
    pub digest: String,
    pub size_bytes: i64,
    pub storage_key: String,
    /// Media type sniffed when the content was first stored.
    pub media_type: String,
    /// Number of user files pointing at this row.
    pub reference_count: i64,
    /// Owner charged when the content was first stored.
    pub origin_owner_id: Option<Uuid>,
    /// Owner whose delete last decremented the reference count.
    pub last_unlinked_by: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// User files
// =============================================================================

/// Owner-visible file joined with the physical content it references.
#[derive(Debug, Clone, FromRow)]
pub struct UserFileRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub physical_file_id: Uuid,
    pub filename: String,
    pub media_type: String,
    pub description: Option<String>,
    /// Sorted, de-duplicated tags.
    pub tags: Json<Vec<String>>,
    pub created_at: OffsetDateTime,
    pub digest: String,
    pub size_bytes: i64,
    pub storage_key: String,
}

/// Values for a user file about to be inserted.
#[derive(Debug, Clone)]
pub struct NewUserFile {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub media_type: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub created_at: OffsetDateTime,
}

/// Per-owner usage figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
    /// Number of user files the owner has.
    pub file_count: i64,
    /// Sum of sizes over the owner's files, counting duplicates each time.
    pub logical_bytes: i64,
    /// Sum of sizes over the distinct payloads the owner references.
    pub unique_bytes: i64,
}

// =============================================================================
// Activity log
// =============================================================================

/// Activity record written by the fire-and-forget activity queue.
#[derive(Debug, Clone, FromRow)]
pub struct ActivityRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Action name, e.g. "upload", "download", "delete".
    pub action: String,
    pub file_id: Option<Uuid>,
    pub trace_id: String,
    pub detail: Option<String>,
    pub created_at: OffsetDateTime,
}
