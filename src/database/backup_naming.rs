//! Backup naming module for generating and parsing timestamp-based artifact names
//!
//! Artifacts are named `<prefix>_<YYYYMMDD_HHMMSS>.sql[.gz][.enc]` and carry
//! two sidecars, `<artifact>.sha256` and `<artifact>.meta`. Names sort by
//! creation time within a prefix.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

/// Timestamp layout shared by artifacts and recovery database names
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const DUMP_EXTENSION: &str = ".sql";
pub const COMPRESSED_EXTENSION: &str = ".gz";
pub const ENCRYPTED_EXTENSION: &str = ".enc";
pub const CHECKSUM_EXTENSION: &str = ".sha256";
pub const METADATA_EXTENSION: &str = ".meta";

/// PostgreSQL truncates identifiers longer than this
const MAX_IDENTIFIER_LEN: usize = 63;

/// Service for generating artifact file names
#[derive(Debug, Clone)]
pub struct BackupNamingService {
    prefix: String,
}

impl BackupNamingService {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Dump file name for a backup started at `timestamp`
    pub fn generate_file_name(&self, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}_{}{}",
            self.prefix,
            timestamp.format(TIMESTAMP_FORMAT),
            DUMP_EXTENSION
        )
    }
}

/// Structured representation of a parsed artifact file name
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactName {
    file_name: String,
    timestamp: DateTime<Utc>,
    compressed: bool,
    encrypted: bool,
}

impl ArtifactName {
    /// Parse an artifact file name (sidecars do not parse)
    pub fn parse(file_name: &str) -> Option<Self> {
        let (rest, encrypted) = match file_name.strip_suffix(ENCRYPTED_EXTENSION) {
            Some(rest) => (rest, true),
            None => (file_name, false),
        };
        let (rest, compressed) = match rest.strip_suffix(COMPRESSED_EXTENSION) {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let stem = rest.strip_suffix(DUMP_EXTENSION)?;

        // Split from the right: the prefix itself may contain underscores
        let mut parts = stem.rsplitn(3, '_');
        let time = parts.next()?;
        let date = parts.next()?;
        let prefix = parts.next()?;
        if prefix.is_empty() || date.len() != 8 || time.len() != 6 {
            return None;
        }

        let naive =
            NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), TIMESTAMP_FORMAT).ok()?;

        Some(Self {
            file_name: file_name.to_string(),
            timestamp: naive.and_utc(),
            compressed,
            encrypted,
        })
    }

    /// Parse the file name component of a path
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the checksum sidecar bound to an artifact
pub fn checksum_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, CHECKSUM_EXTENSION)
}

/// Path of the metadata sidecar bound to an artifact
pub fn metadata_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, METADATA_EXTENSION)
}

/// Path an artifact moves to after a transform appends `extension`
pub fn transformed_path(artifact: &Path, extension: &str) -> PathBuf {
    with_suffix(artifact, extension)
}

/// Get the object key for an artifact or sidecar under the remote prefix
pub fn remote_key(prefix: &str, file_name: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        format!("{}{}", prefix, file_name)
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// Final path component of an object key
pub fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Name of the shadow database created by a parallel restore
pub fn recovery_database_name(name: &str, timestamp: DateTime<Utc>) -> String {
    suffixed_database_name(name, "recovery", timestamp)
}

/// Name of the disposable database created by a test restore
pub fn test_database_name(name: &str, timestamp: DateTime<Utc>) -> String {
    suffixed_database_name(name, "test", timestamp)
}

fn suffixed_database_name(name: &str, tag: &str, timestamp: DateTime<Utc>) -> String {
    let suffix = format!("_{}_{}", tag, timestamp.format(TIMESTAMP_FORMAT));
    let room = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len());
    let base: String = name.chars().take(room).collect();
    format!("{}{}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_file_name() {
        let service = BackupNamingService::new("attribution_backup");
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();

        assert_eq!(
            service.generate_file_name(timestamp),
            "attribution_backup_20250601_143000.sql"
        );
    }

    #[test]
    fn test_parse_artifact_name() {
        let parsed = ArtifactName::parse("attribution_backup_20250601_143000.sql.gz.enc").unwrap();

        assert_eq!(parsed.file_name(), "attribution_backup_20250601_143000.sql.gz.enc");
        assert!(parsed.is_compressed());
        assert!(parsed.is_encrypted());
        assert_eq!(
            *parsed.timestamp(),
            Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap()
        );

        let plain = ArtifactName::parse("backup_20250601_143000.sql").unwrap();
        assert!(!plain.is_compressed());
        assert!(!plain.is_encrypted());
    }

    #[test]
    fn test_parse_rejects_sidecars_and_junk() {
        assert!(ArtifactName::parse("backup_20250601_143000.sql.gz.sha256").is_none());
        assert!(ArtifactName::parse("backup_20250601_143000.sql.gz.meta").is_none());
        assert!(ArtifactName::parse("backup_2025-06-01_143000.sql").is_none());
        assert!(ArtifactName::parse("_20250601_143000.sql").is_none());
        assert!(ArtifactName::parse("lifeboat.log").is_none());
        assert!(ArtifactName::parse("backup_20251301_143000.sql").is_none());
    }

    #[test]
    fn test_sidecar_paths() {
        let artifact = Path::new("/backups/backup_20250601_143000.sql.gz");
        assert_eq!(
            checksum_path(artifact),
            Path::new("/backups/backup_20250601_143000.sql.gz.sha256")
        );
        assert_eq!(
            metadata_path(artifact),
            Path::new("/backups/backup_20250601_143000.sql.gz.meta")
        );
    }

    #[test]
    fn test_remote_key() {
        assert_eq!(
            remote_key("database-backups/", "backup_20250601_143000.sql.gz"),
            "database-backups/backup_20250601_143000.sql.gz"
        );
        assert_eq!(remote_key("db", "a.sql"), "db/a.sql");
        assert_eq!(key_file_name("database-backups/a.sql"), "a.sql");
    }

    #[test]
    fn test_recovery_database_names() {
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        assert_eq!(
            recovery_database_name("attribution", timestamp),
            "attribution_recovery_20250601_143000"
        );
        assert_eq!(
            test_database_name("attribution", timestamp),
            "attribution_test_20250601_143000"
        );

        let long = "x".repeat(80);
        assert_eq!(test_database_name(&long, timestamp).len(), MAX_IDENTIFIER_LEN);
    }
}
