//! Directory-backed implementation of the RemoteStore trait
//!
//! Treats a directory (typically a network mount) as an object store: keys
//! map to relative paths and an object's last-modified time is the file mtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tracing::debug;

use super::{RemoteObject, RemoteStore};
use crate::database::{DatabaseError, Result};

/// Provides directory-backed object storage for backups
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a key to its path, rejecting keys that would escape the root
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
            return Err(DatabaseError::Storage(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(key))
    }

    async fn collect(&self, dir: &Path, out: &mut Vec<RemoteObject>) -> Result<()> {
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio_fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(RemoteObject {
                    key,
                    last_modified: DateTime::<Utc>::from(meta.modified()?),
                    size_bytes: meta.len(),
                    storage_class: None,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    async fn upload(&self, file: &Path, key: &str, _storage_class: &str) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }
        tokio_fs::copy(file, &dest).await?;
        debug!(key, root = %self.root.display(), "stored object");
        Ok(())
    }

    async fn download(&self, key: &str, destination: &Path) -> Result<()> {
        let source = self.object_path(key)?;
        if !source.exists() {
            return Err(DatabaseError::BackupNotFound);
        }
        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                tokio_fs::create_dir_all(parent).await?;
            }
        }
        tokio_fs::copy(&source, destination).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut objects = Vec::new();
        self.collect(&self.root, &mut objects).await?;
        objects.retain(|o| o.key.starts_with(prefix));
        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if path.exists() {
            tokio_fs::remove_file(path).await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn age(path: &Path, days: i64) {
        let when = SystemTime::now() - std::time::Duration::from_secs((days * 86_400) as u64);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_download_and_list() {
        let temp_dir = tempdir().unwrap();
        let store = DirectoryStore::new(temp_dir.path().join("bucket"));

        let source = temp_dir.path().join("backup_20250601_143000.sql.gz");
        std::fs::write(&source, b"archive").unwrap();

        store
            .upload(&source, "database-backups/backup_20250601_143000.sql.gz", "STANDARD_IA")
            .await
            .unwrap();

        let objects = store.list("database-backups/").await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "database-backups/backup_20250601_143000.sql.gz");
        assert_eq!(objects[0].size_bytes, 7);

        let dest = temp_dir.path().join("restore/downloaded.sql.gz");
        store
            .download("database-backups/backup_20250601_143000.sql.gz", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"archive");

        assert!(matches!(
            store.download("database-backups/missing.sql", temp_dir.path()).await,
            Err(DatabaseError::BackupNotFound)
        ));
    }

    #[tokio::test]
    async fn test_latest_ignores_sidecars_and_older_than() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("bucket");
        let store = DirectoryStore::new(&root);
        let prefix = "database-backups/";

        let source = temp_dir.path().join("src");
        std::fs::write(&source, b"x").unwrap();
        for key in [
            "backup_20250101_000000.sql.gz",
            "backup_20250601_000000.sql.gz",
            "backup_20250601_000000.sql.gz.sha256",
        ] {
            store.upload(&source, &format!("{}{}", prefix, key), "STANDARD").await.unwrap();
        }
        age(&root.join(prefix).join("backup_20250101_000000.sql.gz"), 40);
        age(&root.join(prefix).join("backup_20250601_000000.sql.gz"), 2);
        // Newest object overall is a sidecar; it must not win
        age(&root.join(prefix).join("backup_20250601_000000.sql.gz.sha256"), 0);

        let latest = store.latest(prefix).await.unwrap().unwrap();
        assert_eq!(latest.key, "database-backups/backup_20250601_000000.sql.gz");

        let old = store
            .list_older_than(prefix, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].key, "database-backups/backup_20250101_000000.sql.gz");

        store.delete(&old[0].key).await.unwrap();
        assert_eq!(store.list(prefix).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = tempdir().unwrap();
        let store = DirectoryStore::new(temp_dir.path());
        assert!(store.delete("../outside").await.is_err());
        assert!(store.delete("").await.is_err());
    }
}
