// S3 object store - AWS S3 or any S3-compatible service (MinIO, LocalStack)

use super::{EncryptionMode, EncryptionSettings, ObjectDescriptor, ObjectHead, ObjectStore};
use crate::config::StorageConfig;
use crate::storage::parse_key_date;
use crate::{BackupError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

fn to_chrono(t: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.secs(), t.subsec_nanos())
}

fn transfer_error(op: &str, key: &str, err: impl std::error::Error) -> BackupError {
    BackupError::TransferFailed(format!("{} {} failed: {}", op, key, DisplayErrorContext(err)))
}

/// S3-backed [`ObjectStore`]
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: String,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS credential chain
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&shared);
        if config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        })
    }

    /// Create the bucket when it does not exist yet
    pub async fn ensure_bucket_exists(&self) -> Result<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            return Ok(());
        }

        let mut create = self.client.create_bucket().bucket(&self.bucket);

        // Location constraint for non us-east-1 regions
        if self.region != "us-east-1" {
            use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
            let location = BucketLocationConstraint::from(self.region.as_str());
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(location)
                    .build(),
            );
        }

        create
            .send()
            .await
            .map_err(|e| transfer_error("create bucket", &self.bucket, e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        metadata: &HashMap<String, String>,
        encryption: &EncryptionSettings,
    ) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| transfer_error("read", &path.display().to_string(), e))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .body(body);

        request = match encryption.mode {
            EncryptionMode::None => request,
            EncryptionMode::ProviderManaged => {
                request.server_side_encryption(ServerSideEncryption::Aes256)
            }
            EncryptionMode::CustomerKey => {
                let key_id = encryption.kms_key_id.as_deref().ok_or_else(|| {
                    BackupError::Config("sse-kms encryption requires kms_key_id".to_string())
                })?;
                request
                    .server_side_encryption(ServerSideEncryption::AwsKms)
                    .ssekms_key_id(key_id)
            }
        };

        request
            .send()
            .await
            .map_err(|e| transfer_error("put", key, e))?;
        debug!(bucket = %self.bucket, key = %key, "Object stored");
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => Ok(Some(ObjectHead {
                size: response.content_length().unwrap_or(0).max(0) as u64,
                last_modified: response.last_modified().and_then(to_chrono),
                etag: response.e_tag().map(|t| t.trim_matches('"').to_string()),
                metadata: response.metadata().cloned().unwrap_or_default(),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(transfer_error("head", key, service_error))
                }
            }
        }
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(BackupError::ObjectNotFound(key.to_string()));
                }
                return Err(transfer_error("get", key, service_error));
            }
        };

        let mut body = response.body;
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| transfer_error("read body of", key, e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| transfer_error("delete", key, e))?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| transfer_error("list", prefix, e))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectDescriptor {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                    etag: object.e_tag().map(|t| t.trim_matches('"').to_string()),
                    key_date: parse_key_date(key),
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }
}
