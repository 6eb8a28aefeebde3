//! Operator CLI for the vault.
//!
//! Every command opens the configured stores directly and runs one engine
//! operation. Identity comes from `--user`; there is no authentication here.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::TryStreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use vault_core::config::SweepConfig;
use vault_core::media::{self, SNIFF_LEN};
use vault_core::{FileId, OwnerId, RequestContext, TraceId, VaultConfig};
use vault_engine::{FileRecord, UploadRequest, Vault, VaultError};
use vault_metadata::models::UserRow;

#[derive(Parser)]
#[command(name = "vaultctl")]
#[command(about = "Operator CLI for the deduplicating file vault")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "VAULT_CONFIG",
        default_value = "vault.toml"
    )]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct OwnerArgs {
    /// Name of the user to act as
    #[arg(short, long, env = "VAULT_USER")]
    user: String,

    /// Trace ID recorded with activity (random if omitted)
    #[arg(long)]
    trace_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// User management commands
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Upload a file
    Upload {
        #[command(flatten)]
        owner: OwnerArgs,
        /// File to upload
        path: PathBuf,
        /// Stored filename (defaults to the file's name)
        #[arg(long)]
        name: Option<String>,
        /// Declared media type (defaults to the detected one)
        #[arg(long = "type")]
        media_type: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Tags, repeatable or comma separated
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Download a file to a path, or stdout
    Download {
        #[command(flatten)]
        owner: OwnerArgs,
        file_id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a file
    Delete {
        #[command(flatten)]
        owner: OwnerArgs,
        file_id: String,
    },
    /// List a user's files, newest first
    List {
        #[command(flatten)]
        owner: OwnerArgs,
    },
    /// Show one file
    Show {
        #[command(flatten)]
        owner: OwnerArgs,
        file_id: String,
    },
    /// Tag management commands
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Storage usage and dedup savings of a user
    Usage {
        #[command(flatten)]
        owner: OwnerArgs,
    },
    /// Recent activity of a user
    Activity {
        #[command(flatten)]
        owner: OwnerArgs,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Reconcile metadata and blob storage
    Sweep {
        /// Report what would be deleted without deleting
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Override the orphan grace period
        #[arg(long)]
        grace_period_secs: Option<u64>,
    },
    /// Check metadata and blob store connectivity
    Health,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Create {
        name: String,
        /// Quota in bytes (defaults to quota.default_quota_bytes)
        #[arg(long)]
        quota: Option<u64>,
    },
    /// List users
    List,
    /// Change a user's quota
    Quota { name: String, bytes: u64 },
}

#[derive(Subcommand)]
enum TagCommands {
    /// Add a tag to a file
    Add {
        #[command(flatten)]
        owner: OwnerArgs,
        file_id: String,
        tag: String,
    },
    /// Remove a tag from a file
    Remove {
        #[command(flatten)]
        owner: OwnerArgs,
        file_id: String,
        tag: String,
    },
}

#[derive(Serialize)]
struct UserView {
    id: String,
    name: String,
    used_bytes: i64,
    quota_bytes: i64,
}

impl From<&UserRow> for UserView {
    fn from(user: &UserRow) -> Self {
        Self {
            id: user.id.to_string(),
            name: user.name.clone(),
            used_bytes: user.storage_used_bytes,
            quota_bytes: user.storage_quota_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli {
        config,
        json,
        command,
    } = Cli::parse();

    let config = load_config(&config)?;
    let vault = Vault::from_config(config)
        .await
        .context("failed to open vault")?;

    let result = run(&vault, command, json).await;
    if let Err(e) = &result {
        if let Some(err) = e.downcast_ref::<VaultError>() {
            tracing::debug!(
                code = err.code(),
                retryable = err.is_retryable(),
                "Command failed"
            );
        }
    }
    vault.shutdown().await;
    result
}

async fn run(vault: &Vault, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::User { command } => handle_user_command(vault, command, json).await,
        Commands::Upload {
            owner,
            path,
            name,
            media_type,
            description,
            tags,
        } => {
            let ctx = resolve_owner(vault, &owner).await?;
            handle_upload(vault, &ctx, &path, name, media_type, description, tags, json).await
        }
        Commands::Download {
            owner,
            file_id,
            output,
        } => {
            let ctx = resolve_owner(vault, &owner).await?;
            handle_download(vault, &ctx, parse_file_id(&file_id)?, output.as_deref()).await
        }
        Commands::Delete { owner, file_id } => {
            let ctx = resolve_owner(vault, &owner).await?;
            let outcome = vault.delete(&ctx, parse_file_id(&file_id)?).await?;
            if json {
                return print_json(&outcome);
            }
            println!("Deleted: {} ({})", outcome.filename, outcome.file_id);
            if outcome.reclaimed {
                println!("  Reclaimed: {}", format_bytes(outcome.freed_bytes));
            } else if outcome.reclaim_deferred {
                println!("  Reclaim deferred to the next sweep");
            } else {
                println!("  Remaining references: {}", outcome.remaining_references);
            }
            Ok(())
        }
        Commands::List { owner } => {
            let ctx = resolve_owner(vault, &owner).await?;
            let files = vault.list_files(&ctx).await?;
            if json {
                return print_json(&files);
            }
            if files.is_empty() {
                println!("No files found.");
                return Ok(());
            }
            println!("{:<38} {:>12} {:<28} Name", "ID", "Size", "Type");
            println!("{}", "-".repeat(96));
            for file in files {
                println!(
                    "{:<38} {:>12} {:<28} {}",
                    file.id,
                    format_bytes(file.size),
                    file.media_type,
                    file.filename
                );
            }
            Ok(())
        }
        Commands::Show { owner, file_id } => {
            let ctx = resolve_owner(vault, &owner).await?;
            let file = vault.get_file(&ctx, parse_file_id(&file_id)?).await?;
            if json {
                return print_json(&file);
            }
            print_file(&file);
            Ok(())
        }
        Commands::Tag { command } => handle_tag_command(vault, command, json).await,
        Commands::Usage { owner } => {
            let ctx = resolve_owner(vault, &owner).await?;
            let usage = vault.usage(&ctx).await?;
            if json {
                return print_json(&usage);
            }
            println!("Usage for {}:", owner.user);
            println!("  Files: {}", usage.file_count);
            println!("  Logical size: {}", format_bytes(usage.logical_bytes));
            println!("  Unique size: {}", format_bytes(usage.unique_bytes));
            println!(
                "  Savings: {} ({:.1}%)",
                format_bytes(usage.savings_bytes),
                usage.savings_percent
            );
            println!(
                "  Quota: {} of {}",
                format_bytes(usage.used_bytes),
                format_bytes(usage.quota_bytes)
            );
            Ok(())
        }
        Commands::Activity { owner, limit } => {
            let ctx = resolve_owner(vault, &owner).await?;
            let rows = vault.activity(&ctx, limit).await?;
            if rows.is_empty() {
                println!("No activity recorded.");
                return Ok(());
            }
            for row in rows {
                let file = row.file_id.map(|id| id.to_string()).unwrap_or_default();
                println!(
                    "{} {:<10} {:<36} {}",
                    format_time(row.created_at),
                    row.action,
                    file,
                    row.detail.unwrap_or_default()
                );
            }
            Ok(())
        }
        Commands::Sweep {
            dry_run,
            grace_period_secs,
        } => {
            let mut sweep = vault.config().sweep.clone();
            sweep.dry_run |= dry_run;
            if let Some(secs) = grace_period_secs {
                sweep.grace_period_secs = secs;
            }
            handle_sweep(vault, sweep, json).await
        }
        Commands::Health => {
            let report = vault.health_check().await;
            if json {
                print_json(&report)?;
            } else {
                for (name, component) in [("Metadata", &report.metadata), ("Storage", &report.storage)]
                {
                    match &component.error {
                        None => println!("{name} ({}): ok", component.backend),
                        Some(e) => println!("{name} ({}): FAILED: {e}", component.backend),
                    }
                }
            }
            if !report.is_healthy() {
                anyhow::bail!("health check failed");
            }
            Ok(())
        }
    }
}

async fn handle_user_command(vault: &Vault, command: UserCommands, json: bool) -> Result<()> {
    match command {
        UserCommands::Create { name, quota } => {
            let user = vault.create_user(&name, quota).await?;
            if json {
                return print_json(&UserView::from(&user));
            }
            println!("Created user: {}", user.name);
            println!("  ID: {}", user.id);
            println!(
                "  Quota: {}",
                format_bytes(u64::try_from(user.storage_quota_bytes).unwrap_or(0))
            );
        }
        UserCommands::List => {
            let users = vault.list_users().await?;
            if json {
                let views: Vec<UserView> = users.iter().map(UserView::from).collect();
                return print_json(&views);
            }
            if users.is_empty() {
                println!("No users found.");
                return Ok(());
            }
            println!("{:<38} {:<20} {:>12} {:>12}", "ID", "Name", "Used", "Quota");
            println!("{}", "-".repeat(86));
            for user in users {
                println!(
                    "{:<38} {:<20} {:>12} {:>12}",
                    user.id,
                    user.name,
                    format_bytes(u64::try_from(user.storage_used_bytes).unwrap_or(0)),
                    format_bytes(u64::try_from(user.storage_quota_bytes).unwrap_or(0))
                );
            }
        }
        UserCommands::Quota { name, bytes } => {
            let user = find_user(vault, &name).await?;
            vault
                .set_quota(OwnerId::from_uuid(user.id), bytes)
                .await?;
            println!("Quota for {name} set to {}", format_bytes(bytes));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_upload(
    vault: &Vault,
    ctx: &RequestContext,
    path: &Path,
    name: Option<String>,
    media_type: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    json: bool,
) -> Result<()> {
    let filename = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("path has no file name; pass --name")?,
    };

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    // One byte past the sniff window so detection sees the same prefix the
    // engine does, truncation included.
    let mut head = Vec::with_capacity(SNIFF_LEN + 1);
    (&mut file)
        .take(SNIFF_LEN as u64 + 1)
        .read_to_end(&mut head)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let declared_media_type = media_type.unwrap_or_else(|| media::sniff(&head).to_string());

    let reader = std::io::Cursor::new(head).chain(file);
    let outcome = vault
        .upload(
            ctx,
            reader,
            UploadRequest {
                filename,
                declared_media_type,
                description,
                tags,
            },
        )
        .await?;

    if json {
        return print_json(&outcome);
    }
    if outcome.deduplicated {
        println!("Uploaded (deduplicated): {}", outcome.file.id);
    } else {
        println!("Uploaded: {}", outcome.file.id);
    }
    print_file(&outcome.file);
    Ok(())
}

async fn handle_download(
    vault: &Vault,
    ctx: &RequestContext,
    file_id: FileId,
    output: Option<&Path>,
) -> Result<()> {
    let download = vault.download(ctx, file_id).await?;

    match output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            write_stream(download.stream, file).await?;
            eprintln!(
                "Downloaded {} ({}) to {}",
                download.file.filename,
                format_bytes(download.file.size),
                path.display()
            );
        }
        None => write_stream(download.stream, tokio::io::stdout()).await?,
    }
    Ok(())
}

async fn write_stream<W>(mut stream: vault_storage::ByteStream, mut out: W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(chunk) = stream.try_next().await? {
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(())
}

async fn handle_tag_command(vault: &Vault, command: TagCommands, json: bool) -> Result<()> {
    let file = match command {
        TagCommands::Add {
            owner,
            file_id,
            tag,
        } => {
            let ctx = resolve_owner(vault, &owner).await?;
            vault.add_tag(&ctx, parse_file_id(&file_id)?, &tag).await?
        }
        TagCommands::Remove {
            owner,
            file_id,
            tag,
        } => {
            let ctx = resolve_owner(vault, &owner).await?;
            vault.remove_tag(&ctx, parse_file_id(&file_id)?, &tag).await?
        }
    };

    if json {
        return print_json(&file);
    }
    println!("Tags: {}", file.tags.join(", "));
    Ok(())
}

async fn handle_sweep(vault: &Vault, sweep: SweepConfig, json: bool) -> Result<()> {
    let stats = vault.sweep_with(sweep).await?;
    if json {
        return print_json(&stats);
    }

    if stats.dry_run {
        println!("Sweep (dry run, nothing deleted):");
    } else {
        println!("Sweep completed:");
    }
    println!(
        "  Unreferenced content reclaimed: {} ({})",
        stats.rows_reclaimed,
        format_bytes(stats.bytes_reclaimed)
    );
    println!("  Blobs scanned: {}", stats.blobs_scanned);
    println!(
        "  Orphaned blobs deleted: {} ({})",
        stats.orphans_deleted,
        format_bytes(stats.orphan_bytes)
    );
    println!("  Skipped (within grace period): {}", stats.skipped_recent);
    println!("  Skipped (not content-addressed): {}", stats.skipped_foreign);
    println!("  Errors: {}", stats.errors);

    if stats.errors > 0 {
        anyhow::bail!("sweep finished with {} errors", stats.errors);
    }
    Ok(())
}

/// Load configuration: the TOML file if present, then `VAULT_*` overrides.
fn load_config(path: &Path) -> Result<VaultConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: VaultConfig = figment
        .merge(Env::prefixed("VAULT_").split("__").ignore(&["config", "user"]))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn find_user(vault: &Vault, name: &str) -> Result<UserRow> {
    vault
        .find_user(name)
        .await?
        .with_context(|| format!("user not found: {name}"))
}

async fn resolve_owner(vault: &Vault, owner: &OwnerArgs) -> Result<RequestContext> {
    let user = find_user(vault, &owner.user).await?;
    let owner_id = OwnerId::from_uuid(user.id);
    Ok(match &owner.trace_id {
        Some(trace_id) => RequestContext::with_trace_id(owner_id, TraceId::from_client(trace_id)),
        None => RequestContext::new(owner_id),
    })
}

fn parse_file_id(raw: &str) -> Result<FileId> {
    FileId::parse(raw).with_context(|| format!("invalid file id: {raw}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_file(file: &FileRecord) {
    println!("  ID: {}", file.id);
    println!("  Name: {}", file.filename);
    println!("  Type: {}", file.media_type);
    println!("  Size: {}", format_bytes(file.size));
    println!("  Digest: {}", file.digest);
    if let Some(description) = &file.description {
        println!("  Description: {description}");
    }
    if !file.tags.is_empty() {
        println!("  Tags: {}", file.tags.join(", "));
    }
    println!("  Created: {}", format_time(file.created_at));
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1023), "1023 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
    }

    #[test]
    fn test_parse_file_id() {
        let id = FileId::new();
        assert_eq!(parse_file_id(&id.to_string()).unwrap(), id);
        assert!(parse_file_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            type = "filesystem"
            path = "/tmp/vault-blobs"

            [metadata]
            type = "sqlite"
            path = "/tmp/vault.db"

            [quota]
            reclaim_credit = "originator"

            [sweep]
            grace_period_secs = 60
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.sweep.grace_period_secs, 60);
        assert_eq!(config.quota.reclaim_credit, vault_core::ReclaimCredit::Originator);
        assert!(matches!(
            config.storage,
            vault_core::config::StorageConfig::Filesystem { .. }
        ));
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.toml");
        std::fs::write(&path, "[sweep]\nbatch_size = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
