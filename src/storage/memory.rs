use super::{EncryptionSettings, ObjectDescriptor, ObjectHead, ObjectStore};
use crate::storage::parse_key_date;
use crate::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
    etag: String,
    encryption: EncryptionSettings,
}

#[derive(Default)]
struct Faults {
    corrupt_writes: AtomicBool,
    unavailable: AtomicBool,
    failing_deletes: AtomicBool,
}

/// In-memory object store for tests and dry runs.
///
/// Clones share the same objects. Fault switches simulate an unreachable
/// service, silent corruption on write and refused deletes.
#[derive(Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Arc<DashMap<String, StoredObject>>,
    faults: Arc<Faults>,
}

impl MemoryObjectStore {
    /// Create an empty store for `bucket`
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::new(DashMap::new()),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Flip a byte of every object written from now on
    pub fn set_corrupt_writes(&self, corrupt: bool) {
        self.faults.corrupt_writes.store(corrupt, Ordering::SeqCst);
    }

    /// Fail every call with `TransferFailed`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail every delete with `TransferFailed`
    pub fn set_failing_deletes(&self, failing: bool) {
        self.faults.failing_deletes.store(failing, Ordering::SeqCst);
    }

    /// Replace the stored bytes of `key` without touching its metadata
    pub fn corrupt_object(&self, key: &str) -> bool {
        match self.objects.get_mut(key) {
            Some(mut object) => {
                object.data = corrupt(&object.data);
                true
            }
            None => false,
        }
    }

    /// Drop `key` directly, bypassing fault switches
    pub fn remove_object(&self, key: &str) -> bool {
        self.objects.remove(key).is_some()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Stored bytes of `key`
    pub fn object_bytes(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|o| o.data.clone())
    }

    /// User metadata of `key`
    pub fn object_metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects.get(key).map(|o| o.metadata.clone())
    }

    /// Encryption requested when `key` was written
    pub fn object_encryption(&self, key: &str) -> Option<EncryptionSettings> {
        self.objects.get(key).map(|o| o.encryption.clone())
    }

    /// Every stored key, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn check_available(&self, op: &str) -> Result<()> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(BackupError::TransferFailed(format!(
                "{} failed: object store unavailable",
                op
            )));
        }
        Ok(())
    }
}

fn corrupt(data: &[u8]) -> Bytes {
    let mut bytes = data.to_vec();
    match bytes.first_mut() {
        Some(first) => *first ^= 0xFF,
        None => bytes.push(0),
    }
    Bytes::from(bytes)
}

fn etag_for(data: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(data));
    digest[..32].to_string()
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
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
        self.check_available("put")?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| BackupError::TransferFailed(format!("Failed to read {}: {}", path.display(), e)))?;

        let data = if self.faults.corrupt_writes.load(Ordering::SeqCst) {
            corrupt(&data)
        } else {
            Bytes::from(data)
        };

        let etag = etag_for(&data);
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
                last_modified: Utc::now(),
                etag,
                encryption: encryption.clone(),
            },
        );
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        self.check_available("head")?;
        Ok(self.objects.get(key).map(|o| ObjectHead {
            size: o.data.len() as u64,
            last_modified: Some(o.last_modified),
            etag: Some(o.etag.clone()),
            metadata: o.metadata.clone(),
        }))
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        self.check_available("get")?;
        let data = self
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| BackupError::ObjectNotFound(key.to_string()))?;

        tokio::fs::write(path, &data)
            .await
            .map_err(|e| BackupError::TransferFailed(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(data.len() as u64)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_available("delete")?;
        if self.faults.failing_deletes.load(Ordering::SeqCst) {
            return Err(BackupError::TransferFailed(format!("delete of {} refused", key)));
        }
        self.objects.remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        self.check_available("list")?;
        Ok(self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectDescriptor {
                key: entry.key().clone(),
                size: entry.data.len() as u64,
                last_modified: Some(entry.last_modified),
                etag: Some(entry.etag.clone()),
                key_date: parse_key_date(entry.key()),
            })
            .collect())
    }
}
