//! Object storage: the transport trait, its implementations and the verifying gateway

mod gateway;
mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use gateway::{format_bytes, parse_key_date, BucketUsage, DownloadOutcome, ObjectStoreGateway, UploadReceipt};
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use crate::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Metadata key holding the original artifact filename
pub const META_ORIGINAL_FILENAME: &str = "original-filename";
/// Metadata key holding the hex checksum computed before upload
pub const META_CHECKSUM: &str = "checksum";
/// Metadata key holding the RFC 3339 upload time
pub const META_UPLOAD_TIMESTAMP: &str = "upload-timestamp";
/// Metadata key holding the backup kind
pub const META_BACKUP_KIND: &str = "backup-kind";

/// Server-side encryption requested for stored objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EncryptionMode {
    /// Store as-is
    #[serde(rename = "none")]
    None,
    /// Provider-managed keys (SSE-S3, AES256)
    #[default]
    #[serde(rename = "sse-s3")]
    ProviderManaged,
    /// Customer-managed KMS key (SSE-KMS)
    #[serde(rename = "sse-kms")]
    CustomerKey,
}

impl EncryptionMode {
    /// Stable name used in configuration and the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::ProviderManaged => "sse-s3",
            EncryptionMode::CustomerKey => "sse-kms",
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(EncryptionMode::None),
            "sse-s3" => Ok(EncryptionMode::ProviderManaged),
            "sse-kms" => Ok(EncryptionMode::CustomerKey),
            other => Err(BackupError::Config(format!("unknown encryption mode '{}'", other))),
        }
    }
}

/// Encryption parameters handed to the transport on every write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub mode: EncryptionMode,
    /// Required by the transport only for [`EncryptionMode::CustomerKey`]
    pub kms_key_id: Option<String>,
}

/// Result of a metadata-only lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectHead {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One entry of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// Upload date encoded in the key's `yyyy/mm/dd` segment
    pub key_date: Option<NaiveDate>,
}

/// Raw transport to an object store bucket.
///
/// No retries and no integrity checks happen here; see [`ObjectStoreGateway`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store writes into
    fn bucket(&self) -> &str;

    /// Upload `path` to `key` with user metadata
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        metadata: &HashMap<String, String>,
        encryption: &EncryptionSettings,
    ) -> Result<()>;

    /// Metadata of `key`, or `None` when it does not exist
    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>>;

    /// Stream `key` into `path`, returning the byte count; `ObjectNotFound` when missing
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Every object under `prefix`, in no particular order
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>>;
}
