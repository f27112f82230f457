// Ledger record types - backups, WAL segments, restore operations

use crate::storage::EncryptionMode;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of backup artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Self-consistent snapshot usable as a restore base
    Full,
    /// Batch of archived WAL segments
    Incremental,
}

impl BackupKind {
    /// Stable lowercase name used in keys and the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(BackupError::LedgerUnavailable(format!("unknown backup kind '{}'", other))),
        }
    }
}

/// Lifecycle of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Operation in flight
    Running,
    /// Artifact uploaded and verified
    Completed,
    /// Operation failed; no artifact should be trusted
    Failed,
    /// Remote artifact removed by retention
    Purged,
}

impl BackupStatus {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Purged => "purged",
        }
    }

    /// `running -> completed|failed`, `completed|failed -> purged`
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (BackupStatus::Running, BackupStatus::Completed)
                | (BackupStatus::Running, BackupStatus::Failed)
                | (BackupStatus::Completed, BackupStatus::Purged)
                | (BackupStatus::Failed, BackupStatus::Purged)
        )
    }

    /// Whether the record reached an end state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::Running)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            "purged" => Ok(BackupStatus::Purged),
            other => Err(BackupError::LedgerUnavailable(format!("unknown backup status '{}'", other))),
        }
    }
}

/// Lifecycle of a restore operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    /// Restore in flight
    Running,
    /// Base and every intended WAL segment applied
    Completed,
    /// Base applied but one or more WAL segments were skipped
    Partial,
    /// Restore failed
    Failed,
}

impl RestoreStatus {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Running => "running",
            RestoreStatus::Completed => "completed",
            RestoreStatus::Partial => "partial",
            RestoreStatus::Failed => "failed",
        }
    }

    /// Only `running` may move, and only to a terminal status
    pub fn can_transition_to(&self, next: RestoreStatus) -> bool {
        matches!(self, RestoreStatus::Running) && !matches!(next, RestoreStatus::Running)
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RestoreStatus::Running),
            "completed" => Ok(RestoreStatus::Completed),
            "partial" => Ok(RestoreStatus::Partial),
            "failed" => Ok(RestoreStatus::Failed),
            other => Err(BackupError::LedgerUnavailable(format!("unknown restore status '{}'", other))),
        }
    }
}

/// On-disk format of a backup artifact, fixed when the record is created.
///
/// Selects the restore-apply tool profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// `pg_dump --format=custom` archive, applied with `pg_restore`
    CustomArchive,
    /// Plain SQL script, applied with `psql`
    PlainSql,
    /// Batch of WAL segments described by a manifest
    WalArchive,
}

impl ArtifactFormat {
    /// Stable name stored in the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::CustomArchive => "custom_archive",
            ArtifactFormat::PlainSql => "plain_sql",
            ArtifactFormat::WalArchive => "wal_archive",
        }
    }

    /// File extension for the raw (uncompressed) artifact
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::CustomArchive => "dump",
            ArtifactFormat::PlainSql => "sql",
            ArtifactFormat::WalArchive => "manifest.json",
        }
    }
}

impl FromStr for ArtifactFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "custom_archive" => Ok(ArtifactFormat::CustomArchive),
            "plain_sql" => Ok(ArtifactFormat::PlainSql),
            "wal_archive" => Ok(ArtifactFormat::WalArchive),
            other => Err(BackupError::LedgerUnavailable(format!("unknown artifact format '{}'", other))),
        }
    }
}

/// Compression applied to the stored artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// gzip via flate2
    Gzip,
}

impl CompressionAlgorithm {
    /// Stable name stored in the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            other => Err(BackupError::LedgerUnavailable(format!("unknown compression '{}'", other))),
        }
    }
}

/// One row per backup attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub artifact_format: ArtifactFormat,
    pub parent_backup_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub remote_key: Option<String>,
    pub remote_bucket: Option<String>,
    pub compression: Option<CompressionAlgorithm>,
    pub encryption: Option<EncryptionMode>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub metadata: Value,
}

/// Fields supplied when a backup record is first written
#[derive(Debug, Clone)]
pub struct BackupDraft {
    pub id: String,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub artifact_format: ArtifactFormat,
    pub parent_backup_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub metadata: Value,
}

impl BackupDraft {
    /// A `running` draft with a fresh UUID, started now
    pub fn running(kind: BackupKind, artifact_format: ArtifactFormat) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: BackupStatus::Running,
            artifact_format,
            parent_backup_id: None,
            start_time: Utc::now(),
            label: None,
            description: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent_backup_id = parent;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Materialize the record this draft describes
    pub fn into_record(self) -> BackupRecord {
        BackupRecord {
            id: self.id,
            kind: self.kind,
            status: self.status,
            artifact_format: self.artifact_format,
            parent_backup_id: self.parent_backup_id,
            start_time: self.start_time,
            end_time: None,
            size_bytes: None,
            checksum: None,
            remote_key: None,
            remote_bucket: None,
            compression: None,
            encryption: None,
            label: self.label,
            description: self.description,
            metadata: self.metadata,
        }
    }
}

/// Optional fields written together with a status change
#[derive(Debug, Clone, Default)]
pub struct BackupUpdate {
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub remote_key: Option<String>,
    pub remote_bucket: Option<String>,
    pub compression: Option<CompressionAlgorithm>,
    pub encryption: Option<EncryptionMode>,
    pub description: Option<String>,
    /// Merged key-by-key into the existing metadata object
    pub metadata: Option<Value>,
}

impl BackupUpdate {
    /// Apply onto `record`, leaving unspecified fields unchanged
    pub fn apply_to(self, record: &mut BackupRecord) {
        if let Some(size) = self.size_bytes {
            record.size_bytes = Some(size);
        }
        if let Some(checksum) = self.checksum {
            record.checksum = Some(checksum);
        }
        if let Some(key) = self.remote_key {
            record.remote_key = Some(key);
        }
        if let Some(bucket) = self.remote_bucket {
            record.remote_bucket = Some(bucket);
        }
        if let Some(compression) = self.compression {
            record.compression = Some(compression);
        }
        if let Some(encryption) = self.encryption {
            record.encryption = Some(encryption);
        }
        if let Some(description) = self.description {
            record.description = Some(description);
        }
        if let Some(extra) = self.metadata {
            merge_metadata(&mut record.metadata, extra);
        }
    }
}

/// Shallow merge of `extra` into `base`; non-object values replace `base`
pub fn merge_metadata(base: &mut Value, extra: Value) {
    match (base.as_object_mut(), extra) {
        (Some(target), Value::Object(source)) => {
            for (k, v) in source {
                target.insert(k, v);
            }
        }
        (_, other) => *base = other,
    }
}

/// Check a proposed backup status change against the lifecycle.
///
/// A record may only become `completed` once it carries a remote key and checksum.
pub fn validate_backup_transition(
    record: &BackupRecord,
    next: BackupStatus,
    update: &BackupUpdate,
) -> Result<()> {
    if !record.status.can_transition_to(next) {
        return Err(BackupError::InvalidTransition {
            id: record.id.clone(),
            from: record.status.to_string(),
            to: next.to_string(),
        });
    }

    if next == BackupStatus::Completed {
        let has_key = update.remote_key.is_some() || record.remote_key.is_some();
        let has_checksum = update.checksum.is_some() || record.checksum.is_some();
        if !has_key || !has_checksum {
            return Err(BackupError::InvalidTransition {
                id: record.id.clone(),
                from: record.status.to_string(),
                to: format!("{} (missing remote key or checksum)", next),
            });
        }
    }

    Ok(())
}

/// Position of a WAL segment: its 24-character hex name decoded base-16.
///
/// Timeline, log and segment occupy 32 bits each, so the value needs 96 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalSequence(pub u128);

/// Length of a WAL segment name
pub const WAL_NAME_LEN: usize = 24;

impl WalSequence {
    /// Decode a bare or gzip-suffixed segment name as a base-16 integer.
    ///
    /// Backup labels, partial segments and timeline history files are rejected.
    pub fn from_segment_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".gz").unwrap_or(name);
        if stem.len() != WAL_NAME_LEN || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u128::from_str_radix(stem, 16).ok().map(WalSequence)
    }

    /// Canonical 24-character uppercase segment name
    pub fn segment_name(&self) -> String {
        format!("{:024X}", self.0)
    }
}

impl fmt::Display for WalSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row per archived WAL segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalSegmentRecord {
    pub id: i64,
    pub segment_name: String,
    pub backup_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub size_bytes: u64,
    pub remote_key: String,
    pub checksum: String,
    pub sequence: WalSequence,
}

/// Fields supplied when a WAL segment is recorded
#[derive(Debug, Clone)]
pub struct WalSegmentDraft {
    pub segment_name: String,
    pub backup_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub size_bytes: u64,
    pub remote_key: String,
    pub checksum: String,
    pub sequence: WalSequence,
}

/// One row per restore attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOperationRecord {
    pub id: String,
    pub backup_id: String,
    pub target_time: Option<DateTime<Utc>>,
    pub status: RestoreStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub destination_path: String,
    pub error_detail: Option<String>,
}

/// Fields supplied when a restore operation is first written
#[derive(Debug, Clone)]
pub struct RestoreDraft {
    pub id: String,
    pub backup_id: String,
    pub target_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub destination_path: String,
}

impl RestoreDraft {
    /// A draft with a fresh UUID, started now
    pub fn new(
        backup_id: impl Into<String>,
        target_time: Option<DateTime<Utc>>,
        destination_path: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.into(),
            target_time,
            start_time: Utc::now(),
            destination_path: destination_path.into(),
        }
    }

    /// Materialize as a `running` record
    pub fn into_record(self) -> RestoreOperationRecord {
        RestoreOperationRecord {
            id: self.id,
            backup_id: self.backup_id,
            target_time: self.target_time,
            status: RestoreStatus::Running,
            start_time: self.start_time,
            end_time: None,
            destination_path: self.destination_path,
            error_detail: None,
        }
    }
}

/// Aggregate counts for one (kind, status) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub count: u64,
    pub total_bytes: u64,
}

/// Ledger-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub summaries: Vec<StatusSummary>,
    pub last_full: Option<DateTime<Utc>>,
    pub last_incremental: Option<DateTime<Utc>>,
}
