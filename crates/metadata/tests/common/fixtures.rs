//! Row builders and blob hooks for metadata tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::OffsetDateTime;
use uuid::Uuid;
use vault_metadata::HookError;
use vault_metadata::models::{NewUserFile, PhysicalFileRow, UserRow};
use vault_metadata::repos::BlobHook;

pub fn user(name: &str, quota: i64) -> UserRow {
    UserRow {
        id: Uuid::new_v4(),
        name: format!("{name}-{}", Uuid::new_v4().simple()),
        storage_used_bytes: 0,
        storage_quota_bytes: quota,
        created_at: OffsetDateTime::now_utc(),
    }
}

/// A digest unique to this test run.
pub fn random_digest() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

pub fn physical(digest: &str, size: i64) -> PhysicalFileRow {
    PhysicalFileRow {
        id: Uuid::new_v4(),
        digest: digest.to_string(),
        size_bytes: size,
        storage_key: format!("blobs/{}/{}/{digest}", &digest[0..2], &digest[2..4]),
        media_type: "application/octet-stream".to_string(),
        reference_count: 1,
        origin_owner_id: None,
        last_unlinked_by: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

pub fn new_file(owner: Uuid, filename: &str) -> NewUserFile {
    NewUserFile {
        id: Uuid::new_v4(),
        owner_id: owner,
        filename: filename.to_string(),
        media_type: "application/octet-stream".to_string(),
        description: None,
        tags: Vec::new(),
        created_at: OffsetDateTime::now_utc(),
    }
}

/// Hook that succeeds and records the keys it saw.
#[derive(Default)]
pub struct RecordingHook {
    pub keys: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobHook for RecordingHook {
    async fn run(&self, storage_key: &str) -> Result<(), HookError> {
        self.keys.lock().unwrap().push(storage_key.to_string());
        Ok(())
    }
}

/// Hook that always fails.
#[derive(Default)]
pub struct FailingHook {
    pub calls: AtomicUsize,
}

#[async_trait]
impl BlobHook for FailingHook {
    async fn run(&self, _storage_key: &str) -> Result<(), HookError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("blob backend unavailable".into())
    }
}
