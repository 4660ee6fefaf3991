use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::database::{DatabaseError, DbIdentity, Result};

/// Connection parameters for the PostgreSQL server being protected
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    /// Never written to reports or metadata
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Seconds to wait for a connection before declaring the server unreachable
    pub connect_timeout_secs: u64,
    /// Lock-wait budget handed to the dump utility
    pub lock_wait_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            name: String::new(),
            user: String::from("postgres"),
            password: None,
            connect_timeout_secs: 10,
            lock_wait_timeout_secs: 300,
        }
    }
}

impl DatabaseSettings {
    /// Identity of the configured database
    pub fn identity(&self) -> DbIdentity {
        DbIdentity {
            host: self.host.clone(),
            port: self.port,
            name: self.name.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Object storage destination for off-site copies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// S3 bucket name for database backups
    pub bucket: String,
    /// Key prefix every backup object is stored under
    pub prefix: String,
    /// AWS region for S3 operations
    pub region: String,
    /// Storage class requested on upload
    pub storage_class: String,
    /// Use a mounted directory instead of S3 (bucket is then a path)
    pub directory: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::from("database-backups/"),
            region: String::from("us-east-1"),
            storage_class: String::from("STANDARD_IA"),
            directory: false,
        }
    }
}

/// Configuration for database backup and restore functionality
///
/// Built once at startup and passed by reference into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub database: DatabaseSettings,
    /// Local directory holding artifacts and their sidecars
    pub backup_dir: PathBuf,
    /// File name prefix for artifacts
    pub backup_prefix: String,
    /// Artifacts older than this many days are deleted by rotation
    pub retention_days: u32,
    /// Newest artifacts always kept regardless of age (0 disables the floor)
    pub retention_min_keep: usize,
    /// gzip level for the external compression pass
    pub compression_level: u32,
    /// Run the integrity verifier on a fresh backup before reporting success
    pub verify_after_backup: bool,
    pub remote: Option<RemoteSettings>,
    /// File holding the symmetric encryption secret
    pub encryption_key_file: Option<PathBuf>,
    pub webhook_url: Option<String>,
    /// Service name carried in notifications
    pub service_name: String,
    /// Worker count handed to the restore utility
    pub restore_jobs: usize,
    pub min_disk_space_mb: u64,
    pub min_table_count: u64,
    /// Tables whose presence and row counts prove a restore worked
    pub essential_tables: Vec<String>,
    /// Lease duration for the advisory restore lock
    pub restore_lock_ttl_secs: u64,
    /// Persistent log file (defaults to `<backup_dir>/lifeboat.log`)
    pub log_file: Option<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            backup_dir: PathBuf::from("./backups"),
            backup_prefix: String::from("backup"),
            retention_days: 30,
            retention_min_keep: 0,
            compression_level: 9,
            verify_after_backup: true,
            remote: None,
            encryption_key_file: None,
            webhook_url: None,
            service_name: String::from("lifeboat"),
            restore_jobs: 4,
            min_disk_space_mb: 1024,
            min_table_count: 5,
            essential_tables: vec![
                String::from("users"),
                String::from("businesses"),
                String::from("attribution_events"),
            ],
            restore_lock_ttl_secs: 2 * 60 * 60,
            log_file: None,
        }
    }
}

impl RecoveryConfig {
    /// Load configuration: defaults, then the optional TOML file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Load backup configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DatabaseError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| DatabaseError::Config(format!("Invalid {}: {}", path.display(), e)))
    }

    /// Overlay values from environment variables
    ///
    /// Takes a lookup function so callers decide where variables come from.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("DB_PORT").and_then(|v| v.parse().ok()) {
            self.database.port = v;
        }
        if let Some(v) = get("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = get("DB_PASSWORD") {
            self.database.password = Some(v);
        }
        if let Some(v) = get("BACKUP_DIR") {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BACKUP_PREFIX") {
            self.backup_prefix = v;
        }
        if let Some(v) = get("RETENTION_DAYS").and_then(|v| v.parse().ok()) {
            self.retention_days = v;
        }
        if let Some(v) = get("RETENTION_MIN_KEEP").and_then(|v| v.parse().ok()) {
            self.retention_min_keep = v;
        }
        if let Some(v) = get("S3_BUCKET") {
            self.remote.get_or_insert_with(RemoteSettings::default).bucket = v;
        }
        // Only meaningful once a bucket has been configured somewhere
        if let Some(remote) = self.remote.as_mut() {
            if let Some(v) = get("S3_PREFIX") {
                remote.prefix = v;
            }
            if let Some(v) = get("S3_STORAGE_CLASS") {
                remote.storage_class = v;
            }
            if let Some(v) = get("AWS_REGION") {
                remote.region = v;
            }
        }
        if let Some(v) = get("ENCRYPTION_KEY_FILE") {
            self.encryption_key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
        if let Some(v) = get("SERVICE_NAME") {
            self.service_name = v;
        }
        if let Some(v) = get("RESTORE_JOBS").and_then(|v| v.parse().ok()) {
            self.restore_jobs = v;
        }
        if let Some(v) = get("MIN_DISK_SPACE_MB").and_then(|v| v.parse().ok()) {
            self.min_disk_space_mb = v;
        }
        if let Some(v) = get("MIN_TABLE_COUNT").and_then(|v| v.parse().ok()) {
            self.min_table_count = v;
        }
        if let Some(v) = get("ESSENTIAL_TABLES") {
            self.essential_tables = v
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(v) = get("BACKUP_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
    }

    /// Reject configurations no workflow can run with
    pub fn validate(&self) -> Result<()> {
        if self.database.name.is_empty() {
            return Err(DatabaseError::Config("database name is not set (DB_NAME)".to_string()));
        }
        if self.retention_days == 0 {
            return Err(DatabaseError::Config("retention days must be at least 1".to_string()));
        }
        if self.restore_jobs == 0 {
            return Err(DatabaseError::Config("restore jobs must be at least 1".to_string()));
        }
        if let Some(remote) = &self.remote {
            if remote.bucket.is_empty() {
                return Err(DatabaseError::Config("remote storage configured without a bucket".to_string()));
            }
        }
        Ok(())
    }

    /// Path of the persistent log file
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.backup_dir.join("lifeboat.log"))
    }

    /// Ensure local backup directory exists
    pub fn ensure_backup_dir(&self) -> std::io::Result<()> {
        if !self.backup_dir.exists() {
            std::fs::create_dir_all(&self.backup_dir)?;
        }
        Ok(())
    }
}
