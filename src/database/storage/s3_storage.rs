//! AWS S3 implementation of the RemoteStore trait

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::{RemoteObject, RemoteStore};
use crate::config::RemoteSettings;
use crate::database::{DatabaseError, Result};

/// Provides AWS S3 storage for database backups
pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    /// Create a new S3Store and check the bucket is reachable
    pub async fn new(settings: &RemoteSettings) -> Result<Self> {
        // Default credential provider chain (env, profile, web identity, IMDS)
        let aws_config = aws_config::from_env()
            .region(aws_types::region::Region::new(settings.region.clone()))
            .load()
            .await;

        let client = S3Client::new(&aws_config);

        match client.head_bucket().bucket(&settings.bucket).send().await {
            Ok(_) => {
                info!("Successfully connected to S3 bucket: {}", &settings.bucket);
            }
            Err(err) => {
                error!("Failed to access S3 bucket: {}: {}", &settings.bucket, err);
                return Err(DatabaseError::Storage(format!(
                    "Failed to access S3 bucket {}: {}",
                    &settings.bucket, err
                )));
            }
        }

        Ok(Self {
            client,
            bucket: settings.bucket.clone(),
        })
    }

    /// Map AWS S3 errors to DatabaseError
    fn map_s3_error<E: std::fmt::Debug>(&self, error: SdkError<E>, operation: &str) -> DatabaseError {
        match &error {
            SdkError::ConstructionFailure(_) => {
                DatabaseError::Storage(format!("S3 client construction error during {}: {:?}", operation, error))
            }
            SdkError::DispatchFailure(err) => {
                DatabaseError::Storage(format!("S3 dispatch error during {}: {:?}", operation, err))
            }
            SdkError::ResponseError(err) => {
                DatabaseError::Storage(format!("S3 response error during {}: {:?}", operation, err))
            }
            SdkError::TimeoutError(_) => {
                DatabaseError::Storage(format!("S3 timeout during {}: {:?}", operation, error))
            }
            SdkError::ServiceError(service_err) => {
                if operation == "download" && service_err.raw().http().status() == 404 {
                    DatabaseError::BackupNotFound
                } else {
                    DatabaseError::Storage(format!("S3 service error during {}: {:?}", operation, error))
                }
            }
            _ => DatabaseError::Storage(format!("Unknown S3 error during {}: {:?}", operation, error)),
        }
    }
}

fn to_remote_object(obj: &aws_sdk_s3::types::Object) -> Option<RemoteObject> {
    let key = obj.key()?.to_string();
    let last_modified = obj
        .last_modified()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0))?;
    Some(RemoteObject {
        key,
        last_modified,
        size_bytes: obj.size().max(0) as u64,
        storage_class: obj.storage_class().map(|c| c.as_str().to_string()),
    })
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn upload(&self, file: &Path, key: &str, storage_class: &str) -> Result<()> {
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| DatabaseError::Storage(format!("Failed to read {}: {}", file.display(), e)))?;

        debug!("Uploading {} to S3 bucket {} with key {}", file.display(), self.bucket, key);
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::from(storage_class))
            .body(body)
            .send()
            .await
        {
            Ok(_) => {
                info!("Successfully uploaded {} to S3", key);
                Ok(())
            }
            Err(err) => {
                error!("Failed to upload {} to S3: {}", key, err);
                Err(self.map_s3_error(err, "upload"))
            }
        }
    }

    async fn download(&self, key: &str, destination: &Path) -> Result<()> {
        debug!("Downloading {} from S3 bucket {}", key, self.bucket);

        let resp = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(resp) => resp,
            Err(err) => {
                error!("Failed to download {} from S3: {}", key, err);
                return Err(self.map_s3_error(err, "download"));
            }
        };

        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                tokio_fs::create_dir_all(parent).await?;
            }
        }

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| DatabaseError::Storage(format!("Failed to read S3 response body: {}", e)))?;
        let bytes = body.into_bytes();

        let mut file = tokio_fs::File::create(destination).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        info!("Successfully downloaded {} from S3", key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        debug!("Listing objects in S3 bucket {} under {}", self.bucket, prefix);

        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    error!("Failed to list objects in S3: {}", err);
                    return Err(self.map_s3_error(err, "list"));
                }
            };

            objects.extend(resp.contents().unwrap_or_default().iter().filter_map(to_remote_object));

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        debug!("Found {} objects in S3", objects.len());
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!("Deleting {} from S3 bucket {}", key, self.bucket);

        match self.client.delete_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => {
                info!("Successfully deleted {} from S3", key);
                Ok(())
            }
            Err(err) => {
                error!("Failed to delete {} from S3: {}", key, err);
                Err(self.map_s3_error(err, "delete"))
            }
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
