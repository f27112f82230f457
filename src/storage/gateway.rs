use super::{
    EncryptionMode, EncryptionSettings, ObjectDescriptor, ObjectStore, META_BACKUP_KIND,
    META_CHECKSUM, META_ORIGINAL_FILENAME, META_UPLOAD_TIMESTAMP,
};
use crate::integrity::{checksum_file, ChecksumAlgorithm};
use crate::ledger::BackupKind;
use crate::{BackupError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where an upload landed and what was verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub checksum: String,
    pub size_bytes: u64,
}

/// Result of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// `false` when the object carried no checksum to verify against
    pub verified: bool,
    pub checksum: Option<String>,
    pub size_bytes: u64,
}

/// Object count and total size under the gateway prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketUsage {
    pub bucket: String,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl fmt::Display for BucketUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} objects, {}",
            self.bucket,
            self.total_files,
            format_bytes(self.total_bytes)
        )
    }
}

/// Verified transfer of backup artifacts to and from an [`ObjectStore`].
///
/// Keys follow `{prefix}/{kind}/{yyyy}/{mm}/{dd}/{filename}` with the UTC upload date.
/// Every upload is re-downloaded and re-checksummed before it is reported as stored.
#[derive(Clone)]
pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    encryption: EncryptionSettings,
    algorithm: ChecksumAlgorithm,
}

impl ObjectStoreGateway {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, encryption: EncryptionMode) -> Self {
        let prefix: String = prefix.into();
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            encryption: EncryptionSettings {
                mode: encryption,
                kms_key_id: None,
            },
            algorithm: ChecksumAlgorithm::default(),
        }
    }

    /// KMS key used with [`EncryptionMode::CustomerKey`]
    pub fn with_kms_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.encryption.kms_key_id = Some(key_id.into());
        self
    }

    pub fn with_checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Digest used for upload metadata and verification
    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn encryption(&self) -> EncryptionMode {
        self.encryption.mode
    }

    fn kind_prefix(&self, kind: Option<BackupKind>) -> String {
        match (self.prefix.is_empty(), kind) {
            (true, None) => String::new(),
            (true, Some(kind)) => format!("{}/", kind),
            (false, None) => format!("{}/", self.prefix),
            (false, Some(kind)) => format!("{}/{}/", self.prefix, kind),
        }
    }

    /// Remote key for `filename` uploaded at `at`
    pub fn object_key(&self, kind: BackupKind, filename: &str, at: DateTime<Utc>) -> String {
        format!("{}{}/{}", self.kind_prefix(Some(kind)), at.format("%Y/%m/%d"), filename)
    }

    /// Remote key for `filename` grouped under one batch, so equal names in different
    /// batches never share an object
    pub fn batch_object_key(&self, kind: BackupKind, batch_id: &str, filename: &str, at: DateTime<Utc>) -> String {
        format!(
            "{}{}/{}/{}",
            self.kind_prefix(Some(kind)),
            at.format("%Y/%m/%d"),
            batch_id,
            filename
        )
    }

    /// Upload `local_path`, then read it back and compare checksums
    pub async fn upload(&self, local_path: &Path, kind: BackupKind, filename: &str) -> Result<UploadReceipt> {
        let now = Utc::now();
        let key = self.object_key(kind, filename, now);
        self.upload_to_key(local_path, kind, filename, key, now).await
    }

    /// Upload one member of a batch under [`batch_object_key`](Self::batch_object_key)
    pub async fn upload_in_batch(
        &self,
        local_path: &Path,
        kind: BackupKind,
        batch_id: &str,
        filename: &str,
    ) -> Result<UploadReceipt> {
        let now = Utc::now();
        let key = self.batch_object_key(kind, batch_id, filename, now);
        self.upload_to_key(local_path, kind, filename, key, now).await
    }

    async fn upload_to_key(
        &self,
        local_path: &Path,
        kind: BackupKind,
        filename: &str,
        key: String,
        now: DateTime<Utc>,
    ) -> Result<UploadReceipt> {
        let checksum = checksum_file(local_path, self.algorithm).await?;
        let size_bytes = tokio::fs::metadata(local_path).await?.len();

        let mut metadata = HashMap::new();
        metadata.insert(META_ORIGINAL_FILENAME.to_string(), filename.to_string());
        metadata.insert(META_CHECKSUM.to_string(), checksum.clone());
        metadata.insert(META_UPLOAD_TIMESTAMP.to_string(), now.to_rfc3339());
        metadata.insert(META_BACKUP_KIND.to_string(), kind.to_string());

        info!(
            bucket = %self.bucket(),
            key = %key,
            size = %format_bytes(size_bytes),
            "Uploading artifact"
        );
        self.store
            .put_file(&key, local_path, &metadata, &self.encryption)
            .await?;

        self.verify_upload(local_path, &key, &checksum).await?;
        info!(key = %key, "Upload verified");

        Ok(UploadReceipt {
            key,
            checksum,
            size_bytes,
        })
    }

    async fn verify_upload(&self, local_path: &Path, key: &str, expected: &str) -> Result<()> {
        let scratch_dir = local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let scratch = tempfile::Builder::new()
            .prefix(".verify-")
            .tempfile_in(scratch_dir)?;

        self.store
            .get_to_file(key, scratch.path())
            .await
            .map_err(|e| BackupError::TransferFailed(format!("verification download of {} failed: {}", key, e)))?;

        let actual = checksum_file(scratch.path(), self.algorithm).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            error!(key = %key, expected = %expected, actual = %actual, "Upload verification failed");
            return Err(BackupError::IntegrityMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Download `key` to `local_path`, verifying against the stored checksum when present.
    ///
    /// On mismatch the local file is removed.
    pub async fn download(&self, key: &str, local_path: &Path) -> Result<DownloadOutcome> {
        let head = self
            .store
            .head_object(key)
            .await?
            .ok_or_else(|| BackupError::ObjectNotFound(key.to_string()))?;

        info!(bucket = %self.bucket(), key = %key, path = %local_path.display(), "Downloading artifact");
        let size_bytes = self.store.get_to_file(key, local_path).await?;

        let Some(expected) = head.metadata.get(META_CHECKSUM).cloned() else {
            warn!(key = %key, "No checksum metadata; download not verified");
            return Ok(DownloadOutcome {
                verified: false,
                checksum: None,
                size_bytes,
            });
        };

        let actual = checksum_file(local_path, self.algorithm).await?;
        if !actual.eq_ignore_ascii_case(&expected) {
            error!(key = %key, expected = %expected, actual = %actual, "Downloaded artifact failed verification");
            if let Err(e) = tokio::fs::remove_file(local_path).await {
                warn!(path = %local_path.display(), error = %e, "Failed to remove corrupt download");
            }
            return Err(BackupError::IntegrityMismatch {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        debug!(key = %key, "Download verified");
        Ok(DownloadOutcome {
            verified: true,
            checksum: Some(actual),
            size_bytes,
        })
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete_object(key).await?;
        info!(bucket = %self.bucket(), key = %key, "Object removed");
        Ok(())
    }

    /// Objects under the prefix (optionally one kind), most recently modified first
    pub async fn list(&self, kind: Option<BackupKind>) -> Result<Vec<ObjectDescriptor>> {
        let mut objects = self.store.list_objects(&self.kind_prefix(kind)).await?;
        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(objects)
    }

    /// Count and total size of every object under the prefix
    pub async fn bucket_usage(&self) -> Result<BucketUsage> {
        let objects = self.store.list_objects(&self.kind_prefix(None)).await?;
        Ok(BucketUsage {
            bucket: self.bucket().to_string(),
            total_files: objects.len(),
            total_bytes: objects.iter().map(|o| o.size).sum(),
        })
    }
}

/// Upload date from the first `yyyy/mm/dd` run of path segments in `key`
pub fn parse_key_date(key: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = key.split('/').collect();
    parts.windows(3).find_map(|w| {
        let digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
        if !(digits(w[0], 4) && digits(w[1], 2) && digits(w[2], 2)) {
            return None;
        }
        NaiveDate::from_ymd_opt(w[0].parse().ok()?, w[1].parse().ok()?, w[2].parse().ok()?)
    })
}

/// Human-readable size, e.g. `1.50 KB`
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}
