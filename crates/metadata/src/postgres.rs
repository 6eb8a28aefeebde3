//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::files::{USER_FILE_SELECT, edit_tags};
use crate::repos::{
    ActivityRepo, BlobHook, FileRepo, LinkOutcome, PhysicalInsert, Reclaimed, Unlinked, UserRepo,
};
use crate::store::{MetadataStore, credit_target};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::types::Json;
use sqlx::{PgConnection, Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use uuid::Uuid;
use vault_core::ReclaimCredit;
use vault_core::config::PgSslMode;
use vault_core::media::OCTET_STREAM;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password arrive separately, e.g. through the environment.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn edit_file_tags(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
        tag: &str,
        add: bool,
    ) -> MetadataResult<Option<UserFileRow>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<Json<Vec<String>>> = sqlx::query_scalar(
            "SELECT tags FROM user_files WHERE id = $1 AND owner_id = $2 FOR UPDATE",
        )
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(Json(mut tags)) = current else {
            return Ok(None);
        };

        if edit_tags(&mut tags, tag, add)? {
            sqlx::query("UPDATE user_files SET tags = $1 WHERE id = $2")
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
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold more than one command.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

async fn fetch_user_file(conn: &mut PgConnection, file_id: Uuid) -> MetadataResult<UserFileRow> {
    let sql = format!("{USER_FILE_SELECT} WHERE u.id = $1");
    let row = sqlx::query_as::<_, UserFileRow>(&sql)
        .bind(file_id)
        .fetch_one(conn)
        .await?;
    Ok(row)
}

async fn insert_user_file(
    conn: &mut PgConnection,
    physical_file_id: Uuid,
    file: &NewUserFile,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO user_files
            (id, owner_id, physical_file_id, filename, media_type, description, tags, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
impl UserRepo for PostgresStore {
    async fn create_user(&self, user: &UserRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, name, storage_used_bytes, storage_quota_bytes, created_at)
            VALUES ($1, $2, $3, $4, $5)
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
            Err(e) if crate::error::is_unique_violation(&e) => Err(MetadataError::AlreadyExists(
                format!("user {}", user.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_user_by_name(&self, name: &str) -> MetadataResult<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE name = $1")
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
        let result = sqlx::query("UPDATE users SET storage_quota_bytes = $1 WHERE id = $2")
            .bind(quota_bytes)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FileRepo for PostgresStore {
    async fn find_physical_file(&self, digest: &str) -> MetadataResult<Option<PhysicalFileRow>> {
        let row =
            sqlx::query_as::<_, PhysicalFileRow>("SELECT * FROM physical_files WHERE digest = $1")
                .bind(digest)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn get_physical_file(&self, id: Uuid) -> MetadataResult<Option<PhysicalFileRow>> {
        let row = sqlx::query_as::<_, PhysicalFileRow>("SELECT * FROM physical_files WHERE id = $1")
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

        // ON CONFLICT waits for any in-flight transaction holding the same
        // digest, so a concurrent reclaim resolves before this decides.
        let inserted = sqlx::query(
            r#"
            INSERT INTO physical_files
                (id, digest, size_bytes, storage_key, media_type, reference_count,
                 origin_owner_id, last_unlinked_by, created_at)
            VALUES ($1, $2, $3, $4, $5, 1, $6, NULL, $7)
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
            SET storage_used_bytes = storage_used_bytes + $1
            WHERE id = $2 AND storage_used_bytes + $1 <= storage_quota_bytes
            "#,
        )
        .bind(physical.size_bytes)
        .bind(file.owner_id)
        .execute(&mut *tx)
        .await?;

        if charged.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
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
            WHERE id = $1
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
            WHERE id = $1 AND owner_id = $2
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
            SET reference_count = reference_count - 1, last_unlinked_by = $1
            WHERE id = $2
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

        // The row lock taken here blocks concurrent increments until the
        // blob is gone and the delete commits.
        let physical = sqlx::query_as::<_, PhysicalFileRow>(
            "DELETE FROM physical_files WHERE id = $1 AND reference_count <= 0 RETURNING *",
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
                SET storage_used_bytes = GREATEST(0, storage_used_bytes - $1)
                WHERE id = $2
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

        // The uncommitted claim makes a concurrent insert of the same digest
        // wait until the blob is gone and the claim is dropped.
        let claim = Uuid::new_v4();
        let claimed = sqlx::query(
            r#"
            INSERT INTO physical_files
                (id, digest, size_bytes, storage_key, media_type, reference_count,
                 origin_owner_id, last_unlinked_by, created_at)
            VALUES ($1, $2, 0, $3, $4, 0, NULL, NULL, NOW())
            ON CONFLICT (digest) DO NOTHING
            "#,
        )
        .bind(claim)
        .bind(digest)
        .bind(storage_key)
        .bind(OCTET_STREAM)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            return Ok(false);
        }

        release
            .run(storage_key)
            .await
            .map_err(MetadataError::Hook)?;

        sqlx::query("DELETE FROM physical_files WHERE id = $1")
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
        let mut query =
            QueryBuilder::<Postgres>::new("SELECT * FROM physical_files WHERE reference_count <= 0");
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
        let sql = format!("{USER_FILE_SELECT} WHERE u.id = $1 AND u.owner_id = $2");
        let row = sqlx::query_as::<_, UserFileRow>(&sql)
            .bind(file_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_user_files(&self, owner_id: Uuid) -> MetadataResult<Vec<UserFileRow>> {
        let sql =
            format!("{USER_FILE_SELECT} WHERE u.owner_id = $1 ORDER BY u.created_at DESC, u.id");
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
            SELECT COUNT(*), COALESCE(SUM(p.size_bytes), 0)::BIGINT
            FROM user_files u JOIN physical_files p ON p.id = u.physical_file_id
            WHERE u.owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        let unique_bytes: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(size_bytes), 0)::BIGINT FROM physical_files
            WHERE id IN (SELECT physical_file_id FROM user_files WHERE owner_id = $1)
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

#[async_trait]
impl ActivityRepo for PostgresStore {
    async fn record_activity(&self, activity: &ActivityRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (id, owner_id, action, file_id, trace_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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

    async fn list_activity(&self, owner_id: Uuid, limit: u32) -> MetadataResult<Vec<ActivityRow>> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            r#"
            SELECT * FROM activity_log
            WHERE owner_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(owner_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
