//! Test harness for engine integration tests.

#![allow(dead_code)]

pub mod payloads;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use vault_core::{ContentDigest, OwnerId, RequestContext, VaultConfig};
use vault_engine::{Download, Vault};
use vault_metadata::MetadataStore;
use vault_metadata::models::PhysicalFileRow;
use vault_metadata::repos::{FileRepo, UserRepo};
use vault_storage::{
    ByteStream, FilesystemBackend, KeyStream, ObjectMeta, ObjectStore, StorageError,
    StorageResult,
};

/// Holds the next delete until the test lets it through.
#[derive(Default)]
pub struct DeleteGate {
    /// Signalled once the delete is waiting.
    pub entered: Notify,
    pub release: Notify,
}

/// Object store wrapper whose deletes can be made to fail or wait.
pub struct FlakyStore {
    inner: FilesystemBackend,
    fail_deletes: AtomicBool,
    fail_key: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<DeleteGate>>>,
}

impl FlakyStore {
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Fail deletes of one key only.
    pub fn fail_deletes_of(&self, key: Option<String>) {
        *self.fail_key.lock().unwrap() = key;
    }

    /// Gate the next delete.
    pub fn gate_next_delete(&self) -> Arc<DeleteGate> {
        let gate = Arc::new(DeleteGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let failing_key = self.fail_key.lock().unwrap().as_deref() == Some(key);
        if failing_key || self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected delete failure")));
        }
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        self.inner.list_stream(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky-filesystem"
    }
}

/// A vault over a temp directory: filesystem blobs and SQLite metadata.
pub struct TestVault {
    pub vault: Vault,
    pub storage: Arc<FlakyStore>,
    pub metadata: Arc<dyn MetadataStore>,
    _dir: TempDir,
}

impl TestVault {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut VaultConfig)) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = VaultConfig::for_testing(dir.path());
        configure(&mut config);

        let inner = FilesystemBackend::new(dir.path().join("blobs"))
            .await
            .expect("filesystem backend");
        let storage = Arc::new(FlakyStore {
            inner,
            fail_deletes: AtomicBool::new(false),
            fail_key: Mutex::new(None),
            gate: Mutex::new(None),
        });
        let metadata = vault_metadata::from_config(&config.metadata)
            .await
            .expect("metadata store");
        let vault = Vault::new(config, metadata.clone(), storage.clone());

        Self {
            vault,
            storage,
            metadata,
            _dir: dir,
        }
    }

    /// Create a user and return a request context acting as them.
    pub async fn user(&self, name: &str, quota: u64) -> RequestContext {
        let user = self.vault.create_user(name, Some(quota)).await.unwrap();
        RequestContext::new(OwnerId::from_uuid(user.id))
    }

    pub async fn physical(&self, data: &[u8]) -> Option<PhysicalFileRow> {
        self.metadata
            .find_physical_file(&ContentDigest::compute(data).to_hex())
            .await
            .unwrap()
    }

    pub async fn used_bytes(&self, ctx: &RequestContext) -> i64 {
        self.metadata
            .get_user(*ctx.owner_id.as_uuid())
            .await
            .unwrap()
            .unwrap()
            .storage_used_bytes
    }

    pub async fn blob_exists(&self, data: &[u8]) -> bool {
        self.storage
            .exists(&ContentDigest::compute(data).storage_key())
            .await
            .unwrap()
    }

    pub async fn blob_count(&self) -> usize {
        self.storage.list("blobs/").await.unwrap().len()
    }

    /// Flush the activity queue. The returned directory keeps the database alive.
    pub async fn shutdown(self) -> (Arc<dyn MetadataStore>, TempDir) {
        self.vault.shutdown().await;
        (self.metadata, self._dir)
    }
}

/// Read a download to the end.
pub async fn read_all(download: Download) -> Vec<u8> {
    let chunks: Vec<Bytes> = download.stream.try_collect().await.unwrap();
    chunks.concat()
}
