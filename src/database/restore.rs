//! Restore orchestration
//!
//! A restore is a pipeline over an explicit [`RestoreMode`]:
//!
//! prerequisites → select-source → verify → transform → lock →
//! prepare-target → restore → post-verify → finalize
//!
//! Everything that can reject the artifact (integrity, missing key, a
//! corrupt ciphertext) runs before `prepare-target`, the first stage that
//! touches a database. Temporary decrypted/decompressed files and the
//! advisory lock are registered as cleanup callbacks and released on every
//! exit path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use crate::config::RecoveryConfig;
use crate::database::admin::{DatabaseAdmin, validate_identifier};
use crate::database::assess::DiskUsage;
use crate::database::backup_naming::{
    CHECKSUM_EXTENSION, COMPRESSED_EXTENSION, ENCRYPTED_EXTENSION, checksum_path, key_file_name,
    recovery_database_name, test_database_name,
};
use crate::database::inventory::latest_local_backup;
use crate::database::lock::RestoreLock;
use crate::database::pipeline::{Cleanup, Pipeline, PipelineContext, Stage};
use crate::database::post_verify::{PostRestoreVerifier, VerificationReport};
use crate::database::storage::RemoteStore;
use crate::database::tools::{DumpTool, RestoreOptions};
use crate::database::transform::{self, EncryptionKey};
use crate::database::verify::IntegrityVerifier;
use crate::database::{DatabaseError, Result};
use crate::notify::{Notifier, NotifyStatus};

/// Where a restore writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RestoreMode {
    /// Drop and recreate the production database in place
    Replace,
    /// Restore into a timestamped shadow database next to production
    Parallel,
    /// Restore into a disposable timestamped test database
    Test,
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreMode::Replace => "replace",
            RestoreMode::Parallel => "parallel",
            RestoreMode::Test => "test",
        };
        f.write_str(name)
    }
}

/// Which artifact to restore
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreSource {
    /// A specific file (absolute, or relative to the backup directory)
    Explicit(PathBuf),
    /// Newest local artifact, falling back to the newest remote one
    LatestLocal,
    /// Newest remote artifact, downloaded first
    RemoteLatest,
}

/// Interactive gate in front of destructive restores
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Asks on the terminal; only a literal `yes` confirms
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        let mut stderr = tokio::io::stderr();
        if stderr.write_all(prompt.as_bytes()).await.is_err() || stderr.flush().await.is_err() {
            return false;
        }
        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => line.trim() == "yes",
            Err(e) => {
                warn!(error = %e, "could not read confirmation");
                false
            }
        }
    }
}

/// Result of a completed restore
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub artifact: PathBuf,
    pub mode: RestoreMode,
    pub target: String,
    pub verification: VerificationReport,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

/// Download `key` and its checksum sidecar into `dir`
pub async fn fetch_remote(remote: &dyn RemoteStore, key: &str, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let local = dir.join(key_file_name(key));
    remote.download(key, &local).await?;

    let sidecar_key = format!("{}{}", key, CHECKSUM_EXTENSION);
    match remote.download(&sidecar_key, &checksum_path(&local)).await {
        Ok(()) => {}
        Err(DatabaseError::BackupNotFound) => {
            warn!(key = %sidecar_key, "remote artifact has no checksum sidecar");
        }
        Err(e) => return Err(e),
    }
    info!(key, path = %local.display(), location = %remote.describe(), "downloaded remote backup");
    Ok(local)
}

/// State carried through the restore stages
pub struct RestoreContext<'a> {
    config: &'a RecoveryConfig,
    admin: &'a dyn DatabaseAdmin,
    tools: &'a dyn DumpTool,
    remote: Option<&'a dyn RemoteStore>,
    disk: &'a dyn DiskUsage,
    confirmer: &'a dyn Confirmer,
    source: RestoreSource,
    mode: RestoreMode,
    started_at: DateTime<Utc>,
    cleanup: Cleanup,
    artifact: Option<PathBuf>,
    staged: Option<PathBuf>,
    target: Option<String>,
    verification: Option<VerificationReport>,
    warnings: Vec<String>,
}

impl RestoreContext<'_> {
    fn artifact(&self) -> Result<&Path> {
        self.artifact.as_deref().ok_or(DatabaseError::BackupNotFound)
    }

    fn target(&self) -> Result<&str> {
        self.target
            .as_deref()
            .ok_or_else(|| DatabaseError::Database("restore target not prepared".to_string()))
    }

    fn target_name(&self) -> String {
        let name = &self.config.database.name;
        match self.mode {
            RestoreMode::Replace => name.clone(),
            RestoreMode::Parallel => recovery_database_name(name, self.started_at),
            RestoreMode::Test => test_database_name(name, self.started_at),
        }
    }

    /// Drop a disposable target after a failure; a replaced database has nothing left to undo
    async fn discard_target(&self, target: &str) {
        match self.mode {
            RestoreMode::Parallel | RestoreMode::Test => match self.admin.drop_database(target).await {
                Ok(()) => info!(database = %target, "dropped partially restored target"),
                Err(e) => error!(database = %target, error = %e, "failed to drop partially restored target"),
            },
            RestoreMode::Replace => {
                error!(database = %target, "restore failed after the original database was dropped");
            }
        }
    }

    async fn fetch_latest_remote(&self) -> Result<PathBuf> {
        let (Some(remote), Some(settings)) = (self.remote, self.config.remote.as_ref()) else {
            return Err(DatabaseError::Config("remote storage is not configured".to_string()));
        };
        let latest = remote
            .latest(&settings.prefix)
            .await?
            .ok_or(DatabaseError::BackupNotFound)?;
        fetch_remote(remote, &latest.key, &self.config.backup_dir).await
    }
}

impl PipelineContext for RestoreContext<'_> {
    fn cleanup(&mut self) -> &mut Cleanup {
        &mut self.cleanup
    }
}

struct PrerequisitesStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for PrerequisitesStage {
    fn name(&self) -> &'static str {
        "prerequisites"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        if !ctx.admin.server_reachable().await {
            return Err(DatabaseError::Connectivity(format!(
                "cannot reach {}:{}",
                ctx.config.database.host, ctx.config.database.port
            )));
        }
        ctx.config.ensure_backup_dir()?;
        let space = ctx.disk.usage(&ctx.config.backup_dir).await?;
        if space.available_mb() < ctx.config.min_disk_space_mb {
            return Err(DatabaseError::Resource(format!(
                "{} MB available at {}, {} MB required",
                space.available_mb(),
                ctx.config.backup_dir.display(),
                ctx.config.min_disk_space_mb
            )));
        }
        Ok(())
    }
}

struct SelectSourceStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for SelectSourceStage {
    fn name(&self) -> &'static str {
        "select-source"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        let artifact = match &ctx.source {
            RestoreSource::Explicit(path) => {
                let in_backup_dir = ctx.config.backup_dir.join(path);
                if path.is_file() {
                    path.clone()
                } else if path.is_relative() && in_backup_dir.is_file() {
                    in_backup_dir
                } else {
                    return Err(DatabaseError::BackupNotFound);
                }
            }
            RestoreSource::LatestLocal => match latest_local_backup(&ctx.config.backup_dir).await? {
                Some(backup) => backup.path,
                None if ctx.remote.is_some() => {
                    warn!("no local backups, falling back to remote storage");
                    ctx.fetch_latest_remote().await?
                }
                None => return Err(DatabaseError::BackupNotFound),
            },
            RestoreSource::RemoteLatest => ctx.fetch_latest_remote().await?,
        };
        info!(artifact = %artifact.display(), mode = %ctx.mode, "selected backup");
        ctx.artifact = Some(artifact);
        Ok(())
    }
}

struct VerifyStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for VerifyStage {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        IntegrityVerifier::new(ctx.tools, &ctx.config.backup_dir)
            .verify(ctx.artifact()?)
            .await?;
        Ok(())
    }
}

struct TransformStage;

impl TransformStage {
    fn keep_until_cleanup(ctx: &mut RestoreContext<'_>, temp: tempfile::TempPath, label: &'static str) -> PathBuf {
        let path = temp.to_path_buf();
        ctx.cleanup.defer(label, move || {
            if let Err(e) = temp.close() {
                warn!(error = %e, "failed to remove temporary restore file");
            }
        });
        path
    }
}

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for TransformStage {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        let artifact = ctx.artifact()?.to_path_buf();
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (inner, encrypted) = match file_name.strip_suffix(ENCRYPTED_EXTENSION) {
            Some(inner) => (inner, true),
            None => (file_name.as_str(), false),
        };
        let compressed = inner.ends_with(COMPRESSED_EXTENSION);
        let scratch = ctx.config.backup_dir.clone();

        let mut current = artifact.clone();
        if encrypted {
            let key_file = ctx
                .config
                .encryption_key_file
                .as_deref()
                .ok_or_else(|| DatabaseError::EncryptionKeyMissing(file_name.clone()))?;
            let key = EncryptionKey::from_file(key_file)?;
            let temp = transform::decrypt_to_temp(&current, &key, &scratch).await?;
            current = Self::keep_until_cleanup(ctx, temp, "remove decrypted archive");
        }
        if compressed {
            let temp = transform::decompress_to_temp(&current, &scratch).await?;
            current = Self::keep_until_cleanup(ctx, temp, "remove decompressed archive");
        }

        if current != artifact {
            info!(staged = %current.display(), encrypted, compressed, "artifact staged for restore");
        }
        ctx.staged = Some(current);
        Ok(())
    }
}

struct LockStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for LockStage {
    fn name(&self) -> &'static str {
        "lock"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        let target = ctx.target_name();
        validate_identifier(&target)?;
        let ttl = chrono::Duration::seconds(ctx.config.restore_lock_ttl_secs as i64);
        let mut lock = RestoreLock::acquire(&ctx.config.backup_dir, &target, ttl)?;
        ctx.cleanup.defer("release restore lock", move || lock.release());
        ctx.target = Some(target);
        Ok(())
    }
}

struct PrepareTargetStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for PrepareTargetStage {
    fn name(&self) -> &'static str {
        "prepare-target"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        let target = ctx.target()?.to_string();
        match ctx.mode {
            RestoreMode::Replace => {
                let identity = ctx.config.database.identity();
                let prompt = format!(
                    "This will DROP database {} and replace it with {}.\nType 'yes' to continue: ",
                    identity,
                    ctx.artifact()?.display()
                );
                if !ctx.confirmer.confirm(&prompt).await {
                    return Err(DatabaseError::ConfirmationDeclined(identity.to_string()));
                }
                let terminated = ctx.admin.terminate_connections(&target).await?;
                info!(database = %target, terminated, "terminated active connections");
                ctx.admin.drop_database(&target).await?;
                ctx.admin.create_database(&target).await?;
                warn!(database = %target, "production database dropped and recreated");
            }
            RestoreMode::Parallel | RestoreMode::Test => {
                ctx.admin.create_database(&target).await?;
                info!(database = %target, mode = %ctx.mode, "created restore target");
            }
        }
        Ok(())
    }
}

struct RestoreStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for RestoreStage {
    fn name(&self) -> &'static str {
        "restore"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        let target = ctx.target()?.to_string();
        let staged = ctx.staged.clone().ok_or(DatabaseError::BackupNotFound)?;
        let options = RestoreOptions {
            jobs: ctx.config.restore_jobs,
        };

        let Err(e) = ctx.tools.restore(&staged, &target, &options).await else {
            info!(database = %target, jobs = options.jobs, "restore utility finished");
            return Ok(());
        };

        ctx.discard_target(&target).await;
        Err(e)
    }
}

struct PostVerifyStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for PostVerifyStage {
    fn name(&self) -> &'static str {
        "post-verify"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        let target = ctx.target()?.to_string();
        let report = match PostRestoreVerifier::new(ctx.admin, &ctx.config.essential_tables)
            .verify(&target)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                ctx.discard_target(&target).await;
                return Err(e);
            }
        };
        ctx.warnings.extend(report.warnings());
        ctx.verification = Some(report);
        Ok(())
    }
}

struct FinalizeStage;

#[async_trait]
impl<'a> Stage<RestoreContext<'a>> for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    async fn run(&self, ctx: &mut RestoreContext<'a>) -> Result<()> {
        if ctx.mode != RestoreMode::Replace {
            return Ok(());
        }
        let target = ctx.target()?.to_string();
        let degraded = ctx.verification.as_ref().is_none_or(VerificationReport::degraded);
        if degraded {
            let warning = "restore is degraded, skipping statistics refresh".to_string();
            warn!(database = %target, "{}", warning);
            ctx.warnings.push(warning);
            return Ok(());
        }
        if let Err(e) = ctx.admin.analyze(&target).await {
            let warning = format!("statistics refresh failed: {}", e);
            warn!(database = %target, "{}", warning);
            ctx.warnings.push(warning);
        }
        Ok(())
    }
}

/// Drives restores and related recovery operations
pub struct RestoreOrchestrator<'a> {
    config: &'a RecoveryConfig,
    admin: &'a dyn DatabaseAdmin,
    tools: &'a dyn DumpTool,
    remote: Option<&'a dyn RemoteStore>,
    disk: &'a dyn DiskUsage,
    confirmer: &'a dyn Confirmer,
    notifier: &'a Notifier,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        config: &'a RecoveryConfig,
        admin: &'a dyn DatabaseAdmin,
        tools: &'a dyn DumpTool,
        remote: Option<&'a dyn RemoteStore>,
        disk: &'a dyn DiskUsage,
        confirmer: &'a dyn Confirmer,
        notifier: &'a Notifier,
    ) -> Self {
        Self {
            config,
            admin,
            tools,
            remote,
            disk,
            confirmer,
            notifier,
        }
    }

    fn pipeline() -> Pipeline<RestoreContext<'a>> {
        Pipeline::new("restore")
            .stage(PrerequisitesStage)
            .stage(SelectSourceStage)
            .stage(VerifyStage)
            .stage(TransformStage)
            .stage(LockStage)
            .stage(PrepareTargetStage)
            .stage(RestoreStage)
            .stage(PostVerifyStage)
            .stage(FinalizeStage)
    }

    /// Restore `source` in `mode`, then notify the outcome
    pub async fn restore(&self, source: RestoreSource, mode: RestoreMode) -> Result<RestoreOutcome> {
        let started = Instant::now();
        let mut ctx = RestoreContext {
            config: self.config,
            admin: self.admin,
            tools: self.tools,
            remote: self.remote,
            disk: self.disk,
            confirmer: self.confirmer,
            source,
            mode,
            started_at: Utc::now(),
            cleanup: Cleanup::new(),
            artifact: None,
            staged: None,
            target: None,
            verification: None,
            warnings: Vec::new(),
        };

        if let Err(e) = Self::pipeline().run(&mut ctx).await {
            self.notifier
                .notify(NotifyStatus::Error, &format!("Database restore ({}) failed: {}", mode, e))
                .await;
            return Err(e);
        }

        let (Some(artifact), Some(target), Some(verification)) =
            (ctx.artifact.take(), ctx.target.take(), ctx.verification.take())
        else {
            return Err(DatabaseError::Database("restore finished without a verified target".to_string()));
        };
        let outcome = RestoreOutcome {
            artifact,
            mode,
            target,
            verification,
            warnings: std::mem::take(&mut ctx.warnings),
            duration: started.elapsed(),
        };

        let mut message = format!(
            "Database restore ({}) completed: {} into {}",
            mode,
            key_file_name(&outcome.artifact.to_string_lossy()),
            outcome.target
        );
        if outcome.verification.degraded() {
            message.push_str(" (degraded: ");
            message.push_str(&outcome.warnings.join("; "));
            message.push(')');
        }
        info!(
            target_db = %outcome.target,
            %mode,
            total_rows = outcome.verification.total_rows,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "restore completed"
        );
        self.notifier.notify(NotifyStatus::Success, &message).await;
        Ok(outcome)
    }

    /// Point-in-time recovery needs archived WAL replay, which is not implemented
    pub async fn restore_point_in_time(&self, target_time: &str) -> Result<RestoreOutcome> {
        let message = format!(
            "point-in-time recovery to {} requires continuous WAL archiving and is not implemented; \
             use a full restore instead",
            target_time
        );
        warn!("{}", message);
        Err(DatabaseError::Unsupported(message))
    }

    /// Download a remote object and its checksum into the backup directory
    pub async fn download(&self, key: &str) -> Result<PathBuf> {
        let remote = self
            .remote
            .ok_or_else(|| DatabaseError::Config("remote storage is not configured".to_string()))?;
        fetch_remote(remote, key, &self.config.backup_dir).await
    }
}
