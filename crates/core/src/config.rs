//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Upload ingestion configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Largest accepted upload in bytes. The whole payload is buffered in
    /// memory while it is hashed, so this also bounds per-upload memory.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_max_upload_bytes() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_BYTES
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl IngestConfig {
    /// Validate ingestion limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_upload_bytes == 0 {
            return Err("ingest.max_upload_bytes must be greater than 0".to_string());
        }
        if self.max_upload_bytes > i64::MAX as u64 {
            return Err(format!(
                "ingest.max_upload_bytes {} exceeds maximum value {}",
                self.max_upload_bytes,
                i64::MAX
            ));
        }
        Ok(())
    }
}

/// Which owner's usage is credited when shared content is reclaimed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimCredit {
    /// Credit the owner whose delete dropped the last reference.
    #[default]
    Reclaimer,
    /// Credit the owner who was charged when the content was first stored.
    Originator,
}

/// Quota configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Quota assigned to new users when none is given explicitly.
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,
    /// Reclamation credit policy.
    #[serde(default)]
    pub reclaim_credit: ReclaimCredit,
}

fn default_quota_bytes() -> u64 {
    crate::DEFAULT_QUOTA_BYTES
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_bytes: default_quota_bytes(),
            reclaim_credit: ReclaimCredit::default(),
        }
    }
}

impl QuotaConfig {
    /// Validate quota configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_quota_bytes > i64::MAX as u64 {
            return Err(format!(
                "quota.default_quota_bytes {} exceeds maximum value {}",
                self.default_quota_bytes,
                i64::MAX
            ));
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and most self-hosted S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
        /// Create the bucket at startup when it does not exist.
        #[serde(default)]
        create_bucket: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single node deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only; slow queries are logged, not cancelled).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password. Prefer VAULT_METADATA__PASSWORD over storing it in a file.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds. PostgreSQL cancels longer statements.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be greater than 0".to_string());
                }
                // Either a url or host + database
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Reconciliation sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Minimum age in seconds before an unreferenced blob may be deleted.
    /// Protects blobs written by uploads that have not committed yet.
    #[serde(default = "default_sweep_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Number of zero-reference rows reclaimed per batch.
    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: u32,
    /// Report what would be deleted without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_sweep_grace_period_secs() -> u64 {
    3600 // 1 hour
}

fn default_sweep_batch_size() -> u32 {
    500
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_sweep_grace_period_secs(),
            batch_size: default_sweep_batch_size(),
            dry_run: false,
        }
    }
}

impl SweepConfig {
    /// Get the grace period as a Duration.
    pub fn grace_period(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Validate sweep configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("sweep.batch_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Where activity events are written.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySinkKind {
    /// The metadata store's activity log table.
    ///
    /// On SQLite the worker shares the store's single connection, so each
    /// event insert waits for (and briefly delays) file operations. Use
    /// `tracing` when that contention matters more than the queryable log.
    #[default]
    Metadata,
    /// The tracing log only.
    Tracing,
}

/// Activity log configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Record activity events at all.
    #[serde(default = "default_activity_enabled")]
    pub enabled: bool,
    /// Capacity of the in-memory queue. Events are dropped when it is full.
    #[serde(default = "default_activity_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub sink: ActivitySinkKind,
}

fn default_activity_enabled() -> bool {
    true
}

fn default_activity_queue_capacity() -> usize {
    1024
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            enabled: default_activity_enabled(),
            queue_capacity: default_activity_queue_capacity(),
            sink: ActivitySinkKind::default(),
        }
    }
}

impl ActivityConfig {
    /// Validate activity configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.queue_capacity == 0 {
            return Err("activity.queue_capacity must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Complete vault configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Upload ingestion limits.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Quota defaults and reclamation policy.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Reconciliation sweep configuration.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Activity log configuration.
    #[serde(default)]
    pub activity: ActivityConfig,
}

impl VaultConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata
    /// under `root`, with activity logging disabled.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: root.join("blobs"),
            },
            metadata: MetadataConfig::Sqlite {
                path: root.join("metadata.db"),
                query_timeout_secs: None,
            },
            activity: ActivityConfig {
                enabled: false,
                ..ActivityConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section, returning the first error.
    pub fn validate(&self) -> Result<(), String> {
        self.ingest.validate()?;
        self.quota.validate()?;
        self.storage.validate()?;
        self.metadata.validate()?;
        self.sweep.validate()?;
        self.activity.validate()?;
        Ok(())
    }
}
