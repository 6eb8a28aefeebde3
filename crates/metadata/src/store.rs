//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{ActivityRepo, FileRepo, UserRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UserRepo + FileRepo + ActivityRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store, creating the database file if needed.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(30));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection makes every transaction a critical section.
        // Never acquire a second connection while one is held. Activity log
        // inserts queue for the same connection, behind transactions that
        // hold it across blob I/O in their hooks.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(query_timeout)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = query_timeout.as_secs(),
            "Opened SQLite metadata store"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        tokio::time::timeout(self.query_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| MetadataError::Internal("health check timed out".to_string()))??;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::files::{USER_FILE_SELECT, edit_tags};
    use crate::repos::{BlobHook, LinkOutcome, PhysicalInsert, Reclaimed, Unlinked};
    use sqlx::types::Json;
    use sqlx::{QueryBuilder, SqliteConnection};
    use time::OffsetDateTime;
    use uuid::Uuid;
    use vault_core::ReclaimCredit;
    use vault_core::media::OCTET_STREAM;

    async fn fetch_user_file(
        conn: &mut SqliteConnection,
        file_id: Uuid,
    ) -> MetadataResult<UserFileRow> {
        let sql = format!("{USER_FILE_SELECT} WHERE u.id = ?");
        let row = sqlx::query_as::<_, UserFileRow>(&sql)
            .bind(file_id)
            .fetch_one(conn)
            .await?;
        Ok(row)
    }

    async fn insert_user_file(
        conn: &mut SqliteConnection,
        physical_file_id: Uuid,
        file: &NewUserFile,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_files
                (id, owner_id, physical_file_id, filename, media_type, description, tags, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file.id)
        .bind(file.owner_id)
        .bind(physical_file_id)
        .bind(&file.filename)
        .bind(&file.media_type)
        .bind(&file.description)
        .bind(Json(&file.tags))
        .bind(file.created_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    #[async_trait]
    impl UserRepo for SqliteStore {
        async fn create_user(&self, user: &UserRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO users (id, name, storage_used_bytes, storage_quota_bytes, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(user.id)
            .bind(&user.name)
            .bind(user.storage_used_bytes)
            .bind(user.storage_quota_bytes)
            .bind(user.created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if crate::error::is_unique_violation(&e) => Err(
                    MetadataError::AlreadyExists(format!("user {}", user.name)),
                ),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_user_by_name(&self, name: &str) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_users(&self) -> MetadataResult<Vec<UserRow>> {
            let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn set_user_quota(&self, user_id: Uuid, quota_bytes: i64) -> MetadataResult<bool> {
            let result = sqlx::query("UPDATE users SET storage_quota_bytes = ? WHERE id = ?")
                .bind(quota_bytes)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn find_physical_file(
            &self,
            digest: &str,
        ) -> MetadataResult<Option<PhysicalFileRow>> {
            let row =
                sqlx::query_as::<_, PhysicalFileRow>("SELECT * FROM physical_files WHERE digest = ?")
                    .bind(digest)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn get_physical_file(&self, id: Uuid) -> MetadataResult<Option<PhysicalFileRow>> {
            let row =
                sqlx::query_as::<_, PhysicalFileRow>("SELECT * FROM physical_files WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn insert_new_content(
            &self,
            physical: &PhysicalFileRow,
            file: &NewUserFile,
            ensure: &dyn BlobHook,
        ) -> MetadataResult<PhysicalInsert> {
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO physical_files
                    (id, digest, size_bytes, storage_key, media_type, reference_count,
                     origin_owner_id, last_unlinked_by, created_at)
                VALUES (?, ?, ?, ?, ?, 1, ?, NULL, ?)
                ON CONFLICT (digest) DO NOTHING
                "#,
            )
            .bind(physical.id)
            .bind(&physical.digest)
            .bind(physical.size_bytes)
            .bind(&physical.storage_key)
            .bind(&physical.media_type)
            .bind(file.owner_id)
            .bind(physical.created_at)
            .execute(&mut *tx)
            .await;

            let inserted = match inserted {
                Ok(result) => result,
                // origin_owner_id references a user that does not exist.
                Err(e) if crate::error::is_foreign_key_violation(&e) => {
                    return Err(MetadataError::NotFound(format!("user {}", file.owner_id)));
                }
                Err(e) => return Err(e.into()),
            };

            if inserted.rows_affected() == 0 {
                return Ok(PhysicalInsert::DigestTaken);
            }

            let charged = sqlx::query(
                r#"
                UPDATE users
                SET storage_used_bytes = storage_used_bytes + ?
                WHERE id = ? AND storage_used_bytes + ? <= storage_quota_bytes
                "#,
            )
            .bind(physical.size_bytes)
            .bind(file.owner_id)
            .bind(physical.size_bytes)
            .execute(&mut *tx)
            .await?;

            if charged.rows_affected() == 0 {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
                        .bind(file.owner_id)
                        .fetch_one(&mut *tx)
                        .await?;
                if !exists {
                    return Err(MetadataError::NotFound(format!("user {}", file.owner_id)));
                }
                return Ok(PhysicalInsert::QuotaExceeded);
            }

            insert_user_file(&mut tx, physical.id, file).await?;
            let row = fetch_user_file(&mut tx, file.id).await?;

            ensure
                .run(&physical.storage_key)
                .await
                .map_err(MetadataError::Hook)?;

            tx.commit().await?;
            Ok(PhysicalInsert::Created(row))
        }

        async fn link_existing_content(
            &self,
            physical_file_id: Uuid,
            file: &NewUserFile,
            revive: &dyn BlobHook,
        ) -> MetadataResult<LinkOutcome> {
            let mut tx = self.pool.begin().await?;

            let bumped: Option<(i64, String)> = sqlx::query_as(
                r#"
                UPDATE physical_files
                SET reference_count = reference_count + 1
                WHERE id = ?
                RETURNING reference_count, storage_key
                "#,
            )
            .bind(physical_file_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((reference_count, storage_key)) = bumped else {
                return Ok(LinkOutcome::Vanished);
            };

            if reference_count == 1 {
                tracing::debug!(
                    physical_file_id = %physical_file_id,
                    "Reviving unreferenced content"
                );
                revive.run(&storage_key).await.map_err(MetadataError::Hook)?;
            }

            insert_user_file(&mut tx, physical_file_id, file).await?;
            let row = fetch_user_file(&mut tx, file.id).await?;

            tx.commit().await?;
            Ok(LinkOutcome::Linked(row))
        }

        async fn unlink_user_file(
            &self,
            file_id: Uuid,
            owner_id: Uuid,
        ) -> MetadataResult<Option<Unlinked>> {
            let mut tx = self.pool.begin().await?;

            let deleted: Option<(Uuid, String)> = sqlx::query_as(
                r#"
                DELETE FROM user_files
                WHERE id = ? AND owner_id = ?
                RETURNING physical_file_id, filename
                "#,
            )
            .bind(file_id)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((physical_file_id, filename)) = deleted else {
                return Ok(None);
            };

            let (reference_count, size_bytes, digest): (i64, i64, String) = sqlx::query_as(
                r#"
                UPDATE physical_files
                SET reference_count = reference_count - 1, last_unlinked_by = ?
                WHERE id = ?
                RETURNING reference_count, size_bytes, digest
                "#,
            )
            .bind(owner_id)
            .bind(physical_file_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(Some(Unlinked {
                file_id,
                filename,
                physical_file_id,
                digest,
                size_bytes,
                reference_count,
            }))
        }

        async fn reclaim_physical_file(
            &self,
            physical_file_id: Uuid,
            credit: ReclaimCredit,
            release: &dyn BlobHook,
        ) -> MetadataResult<Option<Reclaimed>> {
            let mut tx = self.pool.begin().await?;

            let physical = sqlx::query_as::<_, PhysicalFileRow>(
                "DELETE FROM physical_files WHERE id = ? AND reference_count <= 0 RETURNING *",
            )
            .bind(physical_file_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(physical) = physical else {
                return Ok(None);
            };

            release
                .run(&physical.storage_key)
                .await
                .map_err(MetadataError::Hook)?;

            let mut credited_owner = None;
            if let Some(owner) = credit_target(&physical, credit) {
                let result = sqlx::query(
                    r#"
                    UPDATE users
                    SET storage_used_bytes = MAX(0, storage_used_bytes - ?)
                    WHERE id = ?
                    "#,
                )
                .bind(physical.size_bytes)
                .bind(owner)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() > 0 {
                    credited_owner = Some(owner);
                }
            }

            tx.commit().await?;

            Ok(Some(Reclaimed {
                physical,
                credited_owner,
            }))
        }

        async fn release_orphan_blob(
            &self,
            digest: &str,
            storage_key: &str,
            release: &dyn BlobHook,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let claim = Uuid::new_v4();
            let claimed = sqlx::query(
                r#"
                INSERT INTO physical_files
                    (id, digest, size_bytes, storage_key, media_type, reference_count,
                     origin_owner_id, last_unlinked_by, created_at)
                VALUES (?, ?, 0, ?, ?, 0, NULL, NULL, ?)
                ON CONFLICT (digest) DO NOTHING
                "#,
            )
            .bind(claim)
            .bind(digest)
            .bind(storage_key)
            .bind(OCTET_STREAM)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                return Ok(false);
            }

            release
                .run(storage_key)
                .await
                .map_err(MetadataError::Hook)?;

            sqlx::query("DELETE FROM physical_files WHERE id = ?")
                .bind(claim)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        }

        async fn list_unreferenced_physical_files(
            &self,
            after: Option<&PhysicalFileRow>,
            limit: u32,
        ) -> MetadataResult<Vec<PhysicalFileRow>> {
            let mut query = QueryBuilder::<Sqlite>::new(
                "SELECT * FROM physical_files WHERE reference_count <= 0",
            );
            if let Some(last) = after {
                query
                    .push(" AND (created_at, id) > (")
                    .push_bind(last.created_at)
                    .push(", ")
                    .push_bind(last.id)
                    .push(")");
            }
            query
                .push(" ORDER BY created_at, id LIMIT ")
                .push_bind(i64::from(limit));

            let rows = query
                .build_query_as::<PhysicalFileRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn get_user_file(
            &self,
            file_id: Uuid,
            owner_id: Uuid,
        ) -> MetadataResult<Option<UserFileRow>> {
            let sql = format!("{USER_FILE_SELECT} WHERE u.id = ? AND u.owner_id = ?");
            let row = sqlx::query_as::<_, UserFileRow>(&sql)
                .bind(file_id)
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_user_files(&self, owner_id: Uuid) -> MetadataResult<Vec<UserFileRow>> {
            let sql = format!(
                "{USER_FILE_SELECT} WHERE u.owner_id = ? ORDER BY u.created_at DESC, u.id"
            );
            let rows = sqlx::query_as::<_, UserFileRow>(&sql)
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn add_tag(
            &self,
            file_id: Uuid,
            owner_id: Uuid,
            tag: &str,
        ) -> MetadataResult<Option<UserFileRow>> {
            self.edit_file_tags(file_id, owner_id, tag, true).await
        }

        async fn remove_tag(
            &self,
            file_id: Uuid,
            owner_id: Uuid,
            tag: &str,
        ) -> MetadataResult<Option<UserFileRow>> {
            self.edit_file_tags(file_id, owner_id, tag, false).await
        }

        async fn usage_summary(&self, owner_id: Uuid) -> MetadataResult<UsageSummary> {
            let (file_count, logical_bytes): (i64, i64) = sqlx::query_as(
                r#"
                SELECT COUNT(*), COALESCE(SUM(p.size_bytes), 0)
                FROM user_files u JOIN physical_files p ON p.id = u.physical_file_id
                WHERE u.owner_id = ?
                "#,
            )
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

            let unique_bytes: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(size_bytes), 0) FROM physical_files
                WHERE id IN (SELECT physical_file_id FROM user_files WHERE owner_id = ?)
                "#,
            )
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

            Ok(UsageSummary {
                file_count,
                logical_bytes,
                unique_bytes,
            })
        }
    }

    impl SqliteStore {
        async fn edit_file_tags(
            &self,
            file_id: Uuid,
            owner_id: Uuid,
            tag: &str,
            add: bool,
        ) -> MetadataResult<Option<UserFileRow>> {
            let mut tx = self.pool.begin().await?;

            let current: Option<Json<Vec<String>>> =
                sqlx::query_scalar("SELECT tags FROM user_files WHERE id = ? AND owner_id = ?")
                    .bind(file_id)
                    .bind(owner_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let Some(Json(mut tags)) = current else {
                return Ok(None);
            };

            if edit_tags(&mut tags, tag, add)? {
                sqlx::query("UPDATE user_files SET tags = ? WHERE id = ?")
                    .bind(Json(&tags))
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;
            }

            let row = fetch_user_file(&mut tx, file_id).await?;
            tx.commit().await?;
            Ok(Some(row))
        }
    }

    #[async_trait]
    impl ActivityRepo for SqliteStore {
        async fn record_activity(&self, activity: &ActivityRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO activity_log (id, owner_id, action, file_id, trace_id, detail, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(activity.id)
            .bind(activity.owner_id)
            .bind(&activity.action)
            .bind(activity.file_id)
            .bind(&activity.trace_id)
            .bind(&activity.detail)
            .bind(activity.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_activity(
            &self,
            owner_id: Uuid,
            limit: u32,
        ) -> MetadataResult<Vec<ActivityRow>> {
            let rows = sqlx::query_as::<_, ActivityRow>(
                r#"
                SELECT * FROM activity_log
                WHERE owner_id = ?
                ORDER BY created_at DESC
                LIMIT ?
                "#,
            )
            .bind(owner_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

/// Owner whose usage is credited when `physical` is reclaimed.
///
/// Under `Reclaimer`, rows that were never unlinked (swept after a crash)
/// fall back to the originator.
pub(crate) fn credit_target(
    physical: &crate::models::PhysicalFileRow,
    credit: vault_core::ReclaimCredit,
) -> Option<uuid::Uuid> {
    match credit {
        vault_core::ReclaimCredit::Reclaimer => {
            physical.last_unlinked_by.or(physical.origin_owner_id)
        }
        vault_core::ReclaimCredit::Originator => physical.origin_owner_id,
    }
}

/// SQLite schema.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    storage_used_bytes INTEGER NOT NULL DEFAULT 0 CHECK (storage_used_bytes >= 0),
    storage_quota_bytes INTEGER NOT NULL CHECK (storage_quota_bytes >= 0),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS physical_files (
    id BLOB PRIMARY KEY,
    digest TEXT NOT NULL UNIQUE,
    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
    storage_key TEXT NOT NULL,
    media_type TEXT NOT NULL,
    reference_count INTEGER NOT NULL CHECK (reference_count >= 0),
    origin_owner_id BLOB REFERENCES users(id) ON DELETE SET NULL,
    last_unlinked_by BLOB REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_physical_files_unreferenced
    ON physical_files(created_at) WHERE reference_count = 0;

CREATE TABLE IF NOT EXISTS user_files (
    id BLOB PRIMARY KEY,
    owner_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    physical_file_id BLOB NOT NULL REFERENCES physical_files(id),
    filename TEXT NOT NULL,
    media_type TEXT NOT NULL,
    description TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_files_owner ON user_files(owner_id, created_at);
CREATE INDEX IF NOT EXISTS idx_user_files_physical ON user_files(physical_file_id);

CREATE TABLE IF NOT EXISTS activity_log (
    id BLOB PRIMARY KEY,
    owner_id BLOB NOT NULL,
    action TEXT NOT NULL,
    file_id BLOB,
    trace_id TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activity_log_owner ON activity_log(owner_id, created_at);
"#;
