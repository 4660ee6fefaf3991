//! Human-readable backup reports and listings

use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::database::assess::{DiskSpace, DiskUsage};
use crate::database::backup_naming::key_file_name;
use crate::database::inventory::{LocalBackup, list_local_backups};
use crate::database::storage::{RemoteObject, RemoteStore};
use crate::database::{DatabaseError, Result};

const REPORT_TEMPLATE: &str = include_str!("../templates/backup_report.txt");
const RECENT_LIMIT: usize = 10;

/// Format a byte count with binary units
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// One line of a backup listing
#[derive(Debug, Clone, Serialize)]
pub struct BackupRow {
    pub name: String,
    pub size: String,
    pub size_bytes: u64,
    pub modified: String,
}

impl From<&LocalBackup> for BackupRow {
    fn from(backup: &LocalBackup) -> Self {
        Self {
            name: backup.name.file_name().to_string(),
            size: human_size(backup.size_bytes),
            size_bytes: backup.size_bytes,
            modified: timestamp(&backup.modified),
        }
    }
}

impl From<&RemoteObject> for BackupRow {
    fn from(object: &RemoteObject) -> Self {
        Self {
            name: key_file_name(&object.key).to_string(),
            size: human_size(object.size_bytes),
            size_bytes: object.size_bytes,
            modified: timestamp(&object.last_modified),
        }
    }
}

/// Render rows as aligned text lines
pub fn format_rows(rows: &[BackupRow]) -> String {
    if rows.is_empty() {
        return "  none\n".to_string();
    }
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
    rows.iter()
        .map(|r| format!("  {:<width$}  {:>10}  {}\n", r.name, r.size, r.modified, width = width))
        .collect()
}

/// Local artifacts, newest first
pub async fn local_rows(config: &RecoveryConfig) -> Result<Vec<BackupRow>> {
    Ok(list_local_backups(&config.backup_dir)
        .await?
        .iter()
        .map(BackupRow::from)
        .collect())
}

/// Remote artifacts under the configured prefix, newest first
pub async fn remote_rows(config: &RecoveryConfig, remote: &dyn RemoteStore) -> Result<Vec<BackupRow>> {
    let prefix = config.remote.as_ref().map(|r| r.prefix.as_str()).unwrap_or_default();
    let mut objects: Vec<_> = remote
        .list(prefix)
        .await?
        .into_iter()
        .filter(RemoteObject::is_artifact)
        .collect();
    objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    Ok(objects.iter().map(BackupRow::from).collect())
}

#[derive(Debug, Serialize)]
struct DiskRow {
    filesystem: String,
    mount_point: String,
    total: String,
    available: String,
    used_percent: u64,
}

impl From<&DiskSpace> for DiskRow {
    fn from(space: &DiskSpace) -> Self {
        Self {
            filesystem: space.filesystem.clone(),
            mount_point: space.mount_point.clone(),
            total: human_size(space.total_bytes),
            available: human_size(space.available_bytes),
            used_percent: space.used_percent(),
        }
    }
}

/// Writes `backup_report_<timestamp>.txt` into the backup directory
pub struct ReportGenerator<'a> {
    config: &'a RecoveryConfig,
    remote: Option<&'a dyn RemoteStore>,
    disk: &'a dyn DiskUsage,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(config: &'a RecoveryConfig, remote: Option<&'a dyn RemoteStore>, disk: &'a dyn DiskUsage) -> Self {
        Self { config, remote, disk }
    }

    /// Render the report text as of `now`
    pub async fn render(&self, now: DateTime<Utc>) -> Result<String> {
        let mut local = local_rows(self.config).await?;
        local.truncate(RECENT_LIMIT);

        let (remote_backups, remote_error) = match self.remote {
            Some(remote) => match remote_rows(self.config, remote).await {
                Ok(mut rows) => {
                    rows.truncate(RECENT_LIMIT);
                    (rows, None)
                }
                Err(e) => {
                    warn!(error = %e, "could not list remote backups for report");
                    (Vec::new(), Some(e.to_string()))
                }
            },
            None => (Vec::new(), None),
        };

        let (disk, disk_error) = match self.disk.usage(&self.config.backup_dir).await {
            Ok(space) => (Some(DiskRow::from(&space)), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let mut env = Environment::new();
        env.add_template("backup_report.txt", REPORT_TEMPLATE)
            .map_err(|e| DatabaseError::Report(e.to_string()))?;
        let template = env
            .get_template("backup_report.txt")
            .map_err(|e| DatabaseError::Report(e.to_string()))?;

        template
            .render(context! {
                generated_at => timestamp(&now),
                database => self.config.database.identity().to_string(),
                backup_dir => self.config.backup_dir.display().to_string(),
                retention_days => self.config.retention_days,
                min_keep => self.config.retention_min_keep,
                encrypted => self.config.encryption_key_file.is_some(),
                webhook => self.config.webhook_url.is_some(),
                remote => self.remote.map(|r| r.describe()),
                local => local,
                remote_backups => remote_backups,
                remote_error => remote_error,
                disk => disk,
                disk_error => disk_error,
            })
            .map_err(|e| DatabaseError::Report(e.to_string()))
    }

    /// Render and write the report; returns its path
    pub async fn write(&self) -> Result<PathBuf> {
        let now = Utc::now();
        let text = self.render(now).await?;
        self.config.ensure_backup_dir()?;
        let path = self
            .config
            .backup_dir
            .join(format!("backup_report_{}.txt", now.format("%Y%m%d_%H%M%S")));
        tokio::fs::write(&path, text).await?;
        info!(path = %path.display(), "backup report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::assess::MockDiskUsage;
    use crate::database::storage::local_storage::DirectoryStore;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_format_rows_aligns_names() {
        let rows = vec![
            BackupRow {
                name: "backup_20250601_143000.sql.gz".to_string(),
                size: "1.0 KiB".to_string(),
                size_bytes: 1024,
                modified: "2025-06-01 14:30:00 UTC".to_string(),
            },
            BackupRow {
                name: "b_20250601_143000.sql".to_string(),
                size: "10 B".to_string(),
                size_bytes: 10,
                modified: "2025-06-01 14:30:00 UTC".to_string(),
            },
        ];
        let text = format_rows(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("1.0 KiB"));
        assert_eq!(lines[0].len(), lines[1].len());
        assert_eq!(format_rows(&[]), "  none\n");
    }

    #[tokio::test]
    async fn test_report_lists_backups_and_disk() {
        let dir = tempdir().unwrap();
        let mut config = RecoveryConfig::default();
        config.database.name = "attribution".to_string();
        config.backup_dir = dir.path().join("backups");
        std::fs::create_dir_all(&config.backup_dir).unwrap();
        std::fs::write(config.backup_dir.join("backup_20250601_143000.sql.gz"), vec![0u8; 2048]).unwrap();
        let store = DirectoryStore::new(dir.path().join("bucket"));

        let mut disk = MockDiskUsage::new();
        disk.expect_usage().returning(|_| {
            Ok(DiskSpace {
                filesystem: "/dev/sda1".to_string(),
                mount_point: "/var".to_string(),
                total_bytes: 100 * 1024 * 1024 * 1024,
                used_bytes: 25 * 1024 * 1024 * 1024,
                available_bytes: 75 * 1024 * 1024 * 1024,
            })
        });

        let generator = ReportGenerator::new(&config, Some(&store), &disk);
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let text = generator.render(now).await.unwrap();

        assert!(text.contains("Generated: 2025-06-02 08:00:00 UTC"));
        assert!(text.contains("attribution@localhost:5432"));
        assert!(text.contains("backup_20250601_143000.sql.gz  2.0 KiB"));
        assert!(text.contains("Remote storage: dir://"));
        assert!(text.contains("/var (/dev/sda1): 75.0 GiB available of 100.0 GiB, 25% used"));
        assert!(text.contains("Encryption:     disabled"));

        let path = generator.write().await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("backup_report_") && name.ends_with(".txt"));
    }
}
