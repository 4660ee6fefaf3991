//! Database backup and recovery for PostgreSQL
//!
//! This module holds the two cooperating workflows (backup creation and
//! restore) together with the pieces they share: artifact naming, sidecars,
//! transforms, integrity checks, retention and remote storage.

// Re-export storage module for public use
pub mod storage;

pub mod admin;
pub mod assess;
pub mod backup;
pub mod backup_naming;
pub mod checksum;
pub mod inventory;
pub mod lock;
pub mod metadata;
pub mod pipeline;
pub mod post_verify;
pub mod restore;
pub mod retention;
pub mod tools;
pub mod transform;
pub mod verify;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the database a backup was taken from or a restore writes into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbIdentity {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl fmt::Display for DbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// Database error type for backup/restore operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup not found")]
    BackupNotFound,

    #[error("Database unreachable: {0}")]
    Connectivity(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Insufficient resources: {0}")]
    Resource(String),

    #[error("Restore into {0} was not confirmed")]
    ConfirmationDeclined(String),

    #[error("Backup {0} is encrypted but no encryption key is configured")]
    EncryptionKeyMissing(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Restore tool failed: {0}")]
    RestoreTool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Restore lock for {target} is held by {holder} until {expires_at}")]
    LockHeld {
        target: String,
        holder: String,
        expires_at: String,
    },

    #[error("Report error: {0}")]
    Report(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<DatabaseError>,
    },
}

impl DatabaseError {
    /// Strip any stage wrappers and return the underlying error
    pub fn root(&self) -> &DatabaseError {
        match self {
            DatabaseError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the workflow stage that produced this error, if known
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            DatabaseError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        DatabaseError::Database(error.to_string())
    }
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;
