//! Storage module for off-site backup copies
//!
//! This module provides an abstraction layer over object storage so the
//! backup and restore workflows can push, pull and expire artifacts without
//! caring whether the destination is S3 or a mounted directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

use crate::config::RemoteSettings;
use crate::database::Result;
use crate::database::backup_naming::{ArtifactName, key_file_name};

pub mod local_storage;
pub mod s3_storage;

/// An object held in remote storage
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub storage_class: Option<String>,
}

impl RemoteObject {
    /// Whether the object is an artifact rather than a sidecar or foreign file
    pub fn is_artifact(&self) -> bool {
        ArtifactName::parse(key_file_name(&self.key)).is_some()
    }
}

/// Provides a unified interface for remote backup storage
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload a local file under `key`
    async fn upload(&self, file: &Path, key: &str, storage_class: &str) -> Result<()>;

    /// Download `key` to `destination`
    async fn download(&self, key: &str, destination: &Path) -> Result<()>;

    /// Every object under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Human-readable location, e.g. `s3://bucket`
    fn describe(&self) -> String;

    /// Most recently modified artifact under `prefix`
    async fn latest(&self, prefix: &str) -> Result<Option<RemoteObject>> {
        let objects = self.list(prefix).await?;
        Ok(objects
            .into_iter()
            .filter(RemoteObject::is_artifact)
            .max_by(|a, b| a.last_modified.cmp(&b.last_modified).then_with(|| a.key.cmp(&b.key))))
    }

    /// Objects under `prefix` last modified before `cutoff`, sidecars included
    async fn list_older_than(&self, prefix: &str, cutoff: DateTime<Utc>) -> Result<Vec<RemoteObject>> {
        let objects = self.list(prefix).await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.last_modified < cutoff)
            .collect())
    }
}

/// Create the remote store described by the configuration
pub async fn create_remote_store(settings: &RemoteSettings) -> Result<Box<dyn RemoteStore>> {
    if settings.directory {
        info!(path = %settings.bucket, "using directory-backed remote storage");
        Ok(Box::new(local_storage::DirectoryStore::new(&settings.bucket)))
    } else {
        Ok(Box::new(s3_storage::S3Store::new(settings).await?))
    }
}
