//! Structured `.meta` sidecar describing a finished artifact

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::database::backup_naming::metadata_path;
use crate::database::{DbIdentity, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub database: DbIdentity,
    pub backup_file: String,
    pub size_bytes: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub checksum_algorithm: String,
    pub dump_tool_version: String,
    pub retention_days: u32,
    pub created_at: DateTime<Utc>,
}

impl BackupMetadata {
    /// Write the sidecar next to `artifact`
    pub async fn write(&self, artifact: &Path) -> Result<PathBuf> {
        let path = metadata_path(artifact);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// Read the sidecar of `artifact`, if present
    pub async fn read(artifact: &Path) -> Result<Option<Self>> {
        let path = metadata_path(artifact);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_metadata_field_names() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("backup_20250601_143000.sql.gz");

        let meta = BackupMetadata {
            database: DbIdentity {
                host: "localhost".to_string(),
                port: 5432,
                name: "attribution".to_string(),
            },
            backup_file: "backup_20250601_143000.sql.gz".to_string(),
            size_bytes: 2048,
            compressed: true,
            encrypted: false,
            checksum_algorithm: "sha256".to_string(),
            dump_tool_version: "pg_dump (PostgreSQL) 16.2".to_string(),
            retention_days: 30,
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap(),
        };
        let path = meta.write(&artifact).await.unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(raw["database"]["name"], "attribution");
        assert_eq!(raw["size_bytes"], 2048);
        assert_eq!(raw["compressed"], true);
        assert_eq!(raw["checksum_algorithm"], "sha256");
        assert_eq!(raw["created_at"], "2025-06-01T14:30:00Z");

        assert_eq!(BackupMetadata::read(&artifact).await.unwrap(), Some(meta));
    }
}
