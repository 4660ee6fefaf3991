//! Read-only disaster assessment
//!
//! Runs independent health checks and collects every failure as a
//! human-readable issue. Nothing here writes, locks or mutates, so an
//! assessment is safe to run on any schedule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::database::admin::DatabaseAdmin;
use crate::database::inventory::list_local_backups;
use crate::database::{DatabaseError, Result};

const MIB: u64 = 1024 * 1024;

/// Space on the filesystem holding a path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSpace {
    pub filesystem: String,
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl DiskSpace {
    pub fn available_mb(&self) -> u64 {
        self.available_bytes / MIB
    }

    pub fn used_percent(&self) -> u64 {
        if self.total_bytes == 0 {
            return 0;
        }
        self.used_bytes * 100 / self.total_bytes
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiskUsage: Send + Sync {
    async fn usage(&self, path: &Path) -> Result<DiskSpace>;
}

/// [`DiskUsage`] backed by POSIX `df -Pk`
pub struct DfProbe;

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Parse the data line of `df -P -k` output
fn parse_df(output: &str) -> Option<DiskSpace> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let kib = |s: &str| s.parse::<u64>().ok().map(|v| v * 1024);
    Some(DiskSpace {
        filesystem: fields[0].to_string(),
        mount_point: fields[5..].join(" "),
        total_bytes: kib(fields[1])?,
        used_bytes: kib(fields[2])?,
        available_bytes: kib(fields[3])?,
    })
}

#[async_trait]
impl DiskUsage for DfProbe {
    async fn usage(&self, path: &Path) -> Result<DiskSpace> {
        let probe = nearest_existing(path);
        let output = Command::new("df")
            .arg("-P")
            .arg("-k")
            .arg(&probe)
            .output()
            .await
            .map_err(|e| DatabaseError::Resource(format!("failed to run df: {}", e)))?;
        if !output.status.success() {
            return Err(DatabaseError::Resource(format!(
                "df failed for {}: {}",
                probe.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_df(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| DatabaseError::Resource("unrecognised df output".to_string()))
    }
}

/// Point-in-time verdict of an assessment
#[derive(Debug, Clone, Serialize)]
pub struct DisasterAssessmentReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct DisasterAssessor<'a> {
    config: &'a RecoveryConfig,
    admin: &'a dyn DatabaseAdmin,
    disk: &'a dyn DiskUsage,
}

impl<'a> DisasterAssessor<'a> {
    pub fn new(config: &'a RecoveryConfig, admin: &'a dyn DatabaseAdmin, disk: &'a dyn DiskUsage) -> Self {
        Self { config, admin, disk }
    }

    pub async fn assess(&self) -> DisasterAssessmentReport {
        let mut issues = Vec::new();

        if self.admin.server_reachable().await {
            self.check_database(&mut issues).await;
        } else {
            issues.push("Database server unreachable".to_string());
        }
        self.check_disk(&mut issues).await;
        self.check_backups(&mut issues).await;

        let report = DisasterAssessmentReport {
            healthy: issues.is_empty(),
            issues,
            checked_at: Utc::now(),
        };
        if report.healthy {
            info!("disaster assessment passed");
        } else {
            for issue in &report.issues {
                warn!(issue = %issue, "disaster assessment issue");
            }
        }
        report
    }

    async fn check_database(&self, issues: &mut Vec<String>) {
        let name = &self.config.database.name;
        match self.admin.database_exists(name).await {
            Ok(true) => {}
            Ok(false) => {
                issues.push(format!("Database {} does not exist", name));
                return;
            }
            Err(e) => {
                issues.push(format!("Could not check whether database {} exists: {}", name, e));
                return;
            }
        }

        if let Err(e) = self.admin.ping_database(name).await {
            issues.push(format!("Database {} is not responding: {}", name, e));
            return;
        }

        match self.admin.table_count(name).await {
            Ok(count) if count < self.config.min_table_count => issues.push(format!(
                "Database {} has only {} tables (expected at least {})",
                name, count, self.config.min_table_count
            )),
            Ok(_) => {}
            Err(e) => issues.push(format!("Could not count tables in {}: {}", name, e)),
        }
    }

    async fn check_disk(&self, issues: &mut Vec<String>) {
        match self.disk.usage(&self.config.backup_dir).await {
            Ok(space) if space.available_mb() < self.config.min_disk_space_mb => issues.push(format!(
                "Low disk space: {} MB available (minimum {} MB)",
                space.available_mb(),
                self.config.min_disk_space_mb
            )),
            Ok(_) => {}
            Err(e) => issues.push(format!("Could not determine disk space: {}", e)),
        }
    }

    async fn check_backups(&self, issues: &mut Vec<String>) {
        match list_local_backups(&self.config.backup_dir).await {
            Ok(backups) if backups.is_empty() => issues.push("No local backups found".to_string()),
            Ok(_) => {}
            Err(e) => issues.push(format!("Could not read backup directory: {}", e)),
        }
    }
}
