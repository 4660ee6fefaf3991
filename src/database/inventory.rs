//! Inventory of local backup artifacts

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::database::Result;
use crate::database::backup_naming::ArtifactName;

/// An artifact found in the backup directory
#[derive(Debug, Clone)]
pub struct LocalBackup {
    pub path: PathBuf,
    pub name: ArtifactName,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Artifacts in `dir`, newest first; sidecars and foreign files are skipped
///
/// A missing directory is an empty inventory.
pub async fn list_local_backups(dir: &Path) -> Result<Vec<LocalBackup>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = ArtifactName::from_path(&path) else {
            continue;
        };
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        backups.push(LocalBackup {
            path,
            name,
            modified: DateTime::<Utc>::from(meta.modified()?),
            size_bytes: meta.len(),
        });
    }

    backups.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.name.timestamp().cmp(a.name.timestamp()))
    });
    Ok(backups)
}

/// Most recently modified local artifact
pub async fn latest_local_backup(dir: &Path) -> Result<Option<LocalBackup>> {
    Ok(list_local_backups(dir).await?.into_iter().next())
}
