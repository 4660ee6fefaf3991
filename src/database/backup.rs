//! PostgreSQL backup creation
//!
//! A backup runs as a staged pipeline: dump → compress → encrypt → checksum
//! → self-check → metadata → upload. The dump stage is fatal; compression and
//! encryption degrade to the previous-stage file with a warning, since a
//! larger or unencrypted backup is still a usable backup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::database::backup_naming::{BackupNamingService, checksum_path, remote_key};
use crate::database::metadata::BackupMetadata;
use crate::database::pipeline::{Cleanup, Pipeline, PipelineContext, Stage};
use crate::database::retention::{RetentionManager, RetentionSummary};
use crate::database::storage::RemoteStore;
use crate::database::tools::DumpTool;
use crate::database::transform::{self, EncryptionKey};
use crate::database::verify::IntegrityVerifier;
use crate::database::{DatabaseError, Result, checksum};
use crate::notify::{Notifier, NotifyStatus};

/// Result of a backup operation
#[derive(Debug, Clone)]
pub struct BackupResult {
    /// Final artifact path
    pub artifact: PathBuf,
    pub checksum: String,
    pub metadata: BackupMetadata,
    /// Remote keys written by the upload stage
    pub uploaded: Vec<String>,
    /// Soft failures the pipeline degraded around
    pub warnings: Vec<String>,
    pub duration: Duration,
}

/// State carried through the backup stages
pub struct BackupContext<'a> {
    config: &'a RecoveryConfig,
    tools: &'a dyn DumpTool,
    remote: Option<&'a dyn RemoteStore>,
    cleanup: Cleanup,
    started_at: DateTime<Utc>,
    artifact: Option<PathBuf>,
    compressed: bool,
    encrypted: bool,
    checksum: Option<String>,
    dump_tool_version: String,
    metadata: Option<BackupMetadata>,
    uploaded: Vec<String>,
    warnings: Vec<String>,
}

impl<'a> BackupContext<'a> {
    fn artifact(&self) -> Result<&Path> {
        self.artifact
            .as_deref()
            .ok_or_else(|| DatabaseError::Dump("no artifact produced".to_string()))
    }

    fn degrade(&mut self, warning: String) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

impl PipelineContext for BackupContext<'_> {
    fn cleanup(&mut self) -> &mut Cleanup {
        &mut self.cleanup
    }
}

struct DumpStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for DumpStage {
    fn name(&self) -> &'static str {
        "dump"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        ctx.config.ensure_backup_dir()?;
        let naming = BackupNamingService::new(&ctx.config.backup_prefix);
        let file_name = naming.generate_file_name(ctx.started_at);
        let path = ctx.config.backup_dir.join(&file_name);

        ctx.dump_tool_version = match ctx.tools.version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "could not determine dump tool version");
                String::from("unknown")
            }
        };

        info!(database = %ctx.config.database.identity(), file = %file_name, "dumping database");
        if let Err(e) = ctx.tools.dump(&ctx.config.database.name, &path).await {
            if path.exists() {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return Err(e);
        }

        ctx.artifact = Some(path);
        Ok(())
    }
}

struct CompressStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for CompressStage {
    fn name(&self) -> &'static str {
        "compress"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        let input = ctx.artifact()?.to_path_buf();
        match transform::compress_file(&input, ctx.config.compression_level).await {
            Ok(output) => {
                ctx.artifact = Some(output);
                ctx.compressed = true;
            }
            Err(e) => ctx.degrade(format!("compression failed, keeping uncompressed dump: {}", e)),
        }
        Ok(())
    }
}

struct EncryptStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for EncryptStage {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        let Some(key_file) = ctx.config.encryption_key_file.as_deref() else {
            return Ok(());
        };
        let input = ctx.artifact()?.to_path_buf();
        let encrypted = match EncryptionKey::from_file(key_file) {
            Ok(key) => transform::encrypt_file(&input, &key).await,
            Err(e) => Err(e),
        };
        match encrypted {
            Ok(output) => {
                ctx.artifact = Some(output);
                ctx.encrypted = true;
            }
            Err(e) => ctx.degrade(format!("encryption failed, keeping unencrypted backup: {}", e)),
        }
        Ok(())
    }
}

struct ChecksumStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for ChecksumStage {
    fn name(&self) -> &'static str {
        "checksum"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        let (_, digest) = checksum::write_sidecar(ctx.artifact()?).await?;
        ctx.checksum = Some(digest);
        Ok(())
    }
}

struct SelfCheckStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for SelfCheckStage {
    fn name(&self) -> &'static str {
        "self-check"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        if !ctx.config.verify_after_backup {
            return Ok(());
        }
        IntegrityVerifier::new(ctx.tools, &ctx.config.backup_dir)
            .verify(ctx.artifact()?)
            .await?;
        Ok(())
    }
}

struct MetadataStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for MetadataStage {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        let artifact = ctx.artifact()?.to_path_buf();
        let size_bytes = tokio::fs::metadata(&artifact).await?.len();
        let backup_file = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let metadata = BackupMetadata {
            database: ctx.config.database.identity(),
            backup_file,
            size_bytes,
            compressed: ctx.compressed,
            encrypted: ctx.encrypted,
            checksum_algorithm: checksum::ALGORITHM.to_string(),
            dump_tool_version: ctx.dump_tool_version.clone(),
            retention_days: ctx.config.retention_days,
            created_at: ctx.started_at,
        };
        metadata.write(&artifact).await?;
        ctx.metadata = Some(metadata);
        Ok(())
    }
}

struct UploadStage;

#[async_trait]
impl<'a> Stage<BackupContext<'a>> for UploadStage {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn run(&self, ctx: &mut BackupContext<'a>) -> Result<()> {
        let (Some(remote), Some(settings)) = (ctx.remote, ctx.config.remote.as_ref()) else {
            return Ok(());
        };
        let artifact = ctx.artifact()?.to_path_buf();

        for file in [artifact.clone(), checksum_path(&artifact)] {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let key = remote_key(&settings.prefix, &file_name);
            remote.upload(&file, &key, &settings.storage_class).await?;
            ctx.uploaded.push(key);
        }
        info!(
            location = %remote.describe(),
            objects = ctx.uploaded.len(),
            "uploaded backup to remote storage"
        );
        Ok(())
    }
}

/// Runs the backup pipeline and the housekeeping around it
pub struct BackupManager<'a> {
    config: &'a RecoveryConfig,
    tools: &'a dyn DumpTool,
    remote: Option<&'a dyn RemoteStore>,
    notifier: &'a Notifier,
}

impl<'a> BackupManager<'a> {
    pub fn new(
        config: &'a RecoveryConfig,
        tools: &'a dyn DumpTool,
        remote: Option<&'a dyn RemoteStore>,
        notifier: &'a Notifier,
    ) -> Self {
        Self {
            config,
            tools,
            remote,
            notifier,
        }
    }

    fn pipeline() -> Pipeline<BackupContext<'a>> {
        Pipeline::new("backup")
            .stage(DumpStage)
            .stage(CompressStage)
            .stage(EncryptStage)
            .stage(ChecksumStage)
            .stage(SelfCheckStage)
            .stage(MetadataStage)
            .stage(UploadStage)
    }

    /// Create a backup of the database
    pub async fn create_backup(&self) -> Result<BackupResult> {
        let started = Instant::now();
        let mut ctx = BackupContext {
            config: self.config,
            tools: self.tools,
            remote: self.remote,
            cleanup: Cleanup::new(),
            started_at: Utc::now(),
            artifact: None,
            compressed: false,
            encrypted: false,
            checksum: None,
            dump_tool_version: String::new(),
            metadata: None,
            uploaded: Vec::new(),
            warnings: Vec::new(),
        };

        Self::pipeline().run(&mut ctx).await?;

        let (Some(artifact), Some(checksum), Some(metadata)) =
            (ctx.artifact.take(), ctx.checksum.take(), ctx.metadata.take())
        else {
            return Err(DatabaseError::Dump("backup pipeline finished without an artifact".to_string()));
        };

        Ok(BackupResult {
            artifact,
            checksum,
            metadata,
            uploaded: std::mem::take(&mut ctx.uploaded),
            warnings: std::mem::take(&mut ctx.warnings),
            duration: started.elapsed(),
        })
    }

    /// Create a backup, notify, and rotate old backups on success
    pub async fn run(&self) -> Result<(BackupResult, Option<RetentionSummary>)> {
        let result = match self.create_backup().await {
            Ok(result) => result,
            Err(e) => {
                self.notifier
                    .notify(NotifyStatus::Error, &format!("Database backup failed: {}", e))
                    .await;
                return Err(e);
            }
        };

        let mut message = format!(
            "Database backup completed: {} ({} bytes)",
            result.metadata.backup_file, result.metadata.size_bytes
        );
        if !result.warnings.is_empty() {
            message.push_str(&format!(" with {} warning(s)", result.warnings.len()));
        }
        info!(
            artifact = %result.artifact.display(),
            size_bytes = result.metadata.size_bytes,
            compressed = result.metadata.compressed,
            encrypted = result.metadata.encrypted,
            elapsed_ms = result.duration.as_millis() as u64,
            "backup completed"
        );
        self.notifier.notify(NotifyStatus::Success, &message).await;

        let retention = RetentionManager::new(self.config, self.remote);
        let summary = match retention.rotate().await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "retention pass failed; backup itself succeeded");
                None
            }
        };
        Ok((result, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteSettings;
    use crate::database::backup_naming::{ArtifactName, metadata_path};
    use crate::database::storage::local_storage::DirectoryStore;
    use crate::database::tools::RestoreOptions;
    use crate::database::verify::is_encrypted;
    use crate::testing::FakeCluster;
    use tempfile::tempdir;

    fn config(dir: &Path) -> RecoveryConfig {
        let mut config = RecoveryConfig::default();
        config.database.name = "attribution".to_string();
        config.backup_dir = dir.join("backups");
        config
    }

    #[tokio::test]
    async fn test_backup_writes_artifact_and_sidecars() {
        let temp_dir = tempdir().unwrap();
        let config = config(temp_dir.path());
        let cluster = FakeCluster::with_sample_database("attribution");
        let notifier = Notifier::disabled();

        let result = BackupManager::new(&config, &cluster, None, &notifier)
            .create_backup()
            .await
            .unwrap();

        let name = ArtifactName::from_path(&result.artifact).unwrap();
        assert!(name.is_compressed());
        assert!(!name.is_encrypted());
        assert!(result.artifact.exists());
        assert!(checksum_path(&result.artifact).exists());
        assert!(metadata_path(&result.artifact).exists());
        // Pre-compression dump was replaced
        assert!(!config.backup_dir.join(name.file_name().trim_end_matches(".gz")).exists());

        let on_disk = std::fs::metadata(&result.artifact).unwrap().len();
        let meta = BackupMetadata::read(&result.artifact).await.unwrap().unwrap();
        assert_eq!(meta.size_bytes, on_disk);
        assert!(meta.compressed);
        assert_eq!(meta.database.name, "attribution");
        assert_eq!(meta.dump_tool_version, "pg_dump (PostgreSQL) 16.2");
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_backup_and_upload() {
        let temp_dir = tempdir().unwrap();
        let key_file = temp_dir.path().join("backup.key");
        std::fs::write(&key_file, "secret").unwrap();

        let mut config = config(temp_dir.path());
        config.encryption_key_file = Some(key_file);
        config.remote = Some(RemoteSettings {
            bucket: temp_dir.path().join("bucket").display().to_string(),
            directory: true,
            ..RemoteSettings::default()
        });
        let cluster = FakeCluster::with_sample_database("attribution");
        let store = DirectoryStore::new(temp_dir.path().join("bucket"));
        let notifier = Notifier::disabled();

        let result = BackupManager::new(&config, &cluster, Some(&store), &notifier)
            .create_backup()
            .await
            .unwrap();

        assert!(is_encrypted(&result.artifact));
        assert!(result.metadata.encrypted);
        assert_eq!(result.uploaded.len(), 2);
        assert!(result.uploaded[0].starts_with("database-backups/"));
        assert!(result.uploaded[1].ends_with(".sha256"));

        let objects = store.list("database-backups/").await.unwrap();
        assert_eq!(objects.len(), 2);
        // Only the final artifact and sidecars remain locally
        let local: Vec<_> = std::fs::read_dir(&config.backup_dir).unwrap().collect();
        assert_eq!(local.len(), 3);
    }

    #[tokio::test]
    async fn test_unreadable_key_degrades_to_unencrypted() {
        let temp_dir = tempdir().unwrap();
        let mut config = config(temp_dir.path());
        config.encryption_key_file = Some(temp_dir.path().join("missing.key"));
        let cluster = FakeCluster::with_sample_database("attribution");
        let notifier = Notifier::disabled();

        let result = BackupManager::new(&config, &cluster, None, &notifier)
            .create_backup()
            .await
            .unwrap();

        assert!(!is_encrypted(&result.artifact));
        assert!(!result.metadata.encrypted);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("encryption failed"));
    }

    #[tokio::test]
    async fn test_dump_failure_is_fatal() {
        let temp_dir = tempdir().unwrap();
        let config = config(temp_dir.path());
        let cluster = FakeCluster::with_sample_database("attribution");
        cluster.fail_dumps();
        let notifier = Notifier::disabled();

        let err = BackupManager::new(&config, &cluster, None, &notifier)
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some("dump"));
        assert!(matches!(err.root(), DatabaseError::Dump(_)));
        assert_eq!(std::fs::read_dir(&config.backup_dir).unwrap().count(), 0);
    }

    /// Dumps through the fake cluster, then blocks the compressed output path
    struct BlockedCompression<'a>(&'a FakeCluster);

    #[async_trait]
    impl DumpTool for BlockedCompression<'_> {
        async fn dump(&self, database: &str, output: &Path) -> Result<()> {
            self.0.dump(database, output).await?;
            let mut blocked = output.as_os_str().to_owned();
            blocked.push(".gz");
            std::fs::create_dir(PathBuf::from(blocked))?;
            Ok(())
        }

        async fn list_contents(&self, archive: &Path) -> Result<Vec<String>> {
            self.0.list_contents(archive).await
        }

        async fn restore(&self, archive: &Path, target: &str, options: &RestoreOptions) -> Result<()> {
            self.0.restore(archive, target, options).await
        }

        async fn version(&self) -> Result<String> {
            self.0.version().await
        }
    }

    #[tokio::test]
    async fn test_compression_failure_keeps_plain_dump() {
        let temp_dir = tempdir().unwrap();
        let config = config(temp_dir.path());
        let cluster = FakeCluster::with_sample_database("attribution");
        let tools = BlockedCompression(&cluster);
        let notifier = Notifier::disabled();

        let result = BackupManager::new(&config, &tools, None, &notifier)
            .create_backup()
            .await
            .unwrap();

        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("compression failed"));
        assert!(result.artifact.to_string_lossy().ends_with(".sql"));
        assert!(result.artifact.is_file());
        assert!(!result.metadata.compressed);
        assert!(checksum_path(&result.artifact).exists());
    }
}
