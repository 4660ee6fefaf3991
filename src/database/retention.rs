//! Age-based rotation of local and remote backups
//!
//! An artifact older than the retention window is deleted together with its
//! `.sha256` and `.meta` sidecars. `retention_min_keep` optionally protects
//! the newest artifacts from deletion regardless of age.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::database::Result;
use crate::database::backup_naming::{CHECKSUM_EXTENSION, METADATA_EXTENSION, checksum_path, metadata_path};
use crate::database::inventory::list_local_backups;
use crate::database::storage::RemoteStore;

/// What a rotation pass removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionSummary {
    /// Local artifacts removed (sidecars not counted)
    pub local_removed: Vec<String>,
    /// Remote keys removed, sidecars included
    pub remote_removed: Vec<String>,
}

pub struct RetentionManager<'a> {
    config: &'a RecoveryConfig,
    remote: Option<&'a dyn RemoteStore>,
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl<'a> RetentionManager<'a> {
    pub fn new(config: &'a RecoveryConfig, remote: Option<&'a dyn RemoteStore>) -> Self {
        Self { config, remote }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.config.retention_days))
    }

    /// Rotate local and, when configured, remote backups
    pub async fn rotate(&self) -> Result<RetentionSummary> {
        self.rotate_at(Utc::now()).await
    }

    /// Rotate as if the current time were `now`
    pub async fn rotate_at(&self, now: DateTime<Utc>) -> Result<RetentionSummary> {
        let cutoff = self.cutoff(now);
        let local_removed = self.rotate_local(cutoff).await?;
        let remote_removed = match (self.remote, self.config.remote.as_ref()) {
            (Some(remote), Some(settings)) => self.rotate_remote(remote, &settings.prefix, cutoff).await?,
            _ => Vec::new(),
        };

        info!(
            retention_days = self.config.retention_days,
            local_removed = local_removed.len(),
            remote_removed = remote_removed.len(),
            "retention pass finished"
        );
        Ok(RetentionSummary {
            local_removed,
            remote_removed,
        })
    }

    async fn rotate_local(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let backups = list_local_backups(&self.config.backup_dir).await?;
        let mut removed = Vec::new();

        for backup in backups.iter().skip(self.config.retention_min_keep) {
            if backup.modified >= cutoff {
                continue;
            }
            // Sidecars first: an artifact never outlives its checksum
            remove_if_present(&checksum_path(&backup.path)).await?;
            remove_if_present(&metadata_path(&backup.path)).await?;
            remove_if_present(&backup.path).await?;
            info!(artifact = %backup.name.file_name(), modified = %backup.modified, "removed expired backup");
            removed.push(backup.name.file_name().to_string());
        }
        Ok(removed)
    }

    async fn rotate_remote(
        &self,
        remote: &dyn RemoteStore,
        prefix: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut protected = HashSet::new();
        if self.config.retention_min_keep > 0 {
            let mut artifacts: Vec<_> = remote
                .list(prefix)
                .await?
                .into_iter()
                .filter(|o| o.is_artifact())
                .collect();
            artifacts.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
            for object in artifacts.into_iter().take(self.config.retention_min_keep) {
                protected.insert(format!("{}{}", object.key, CHECKSUM_EXTENSION));
                protected.insert(format!("{}{}", object.key, METADATA_EXTENSION));
                protected.insert(object.key);
            }
        }

        let mut removed = Vec::new();
        for object in remote.list_older_than(prefix, cutoff).await? {
            if protected.contains(&object.key) {
                debug!(key = %object.key, "keeping expired object inside the minimum-keep floor");
                continue;
            }
            match remote.delete(&object.key).await {
                Ok(()) => removed.push(object.key),
                Err(e) => warn!(key = %object.key, error = %e, "failed to delete expired remote object"),
            }
        }
        Ok(removed)
    }
}
