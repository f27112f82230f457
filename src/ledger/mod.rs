//! Metadata ledger: the durable source of truth for what backups exist and their state

mod memory;
pub mod postgres;
pub mod records;

pub use memory::MemoryLedger;
pub use postgres::{LedgerConfig, PostgresLedger};
pub use records::{
    merge_metadata, validate_backup_transition, ArtifactFormat, BackupDraft, BackupKind,
    BackupRecord, BackupStatus, BackupUpdate, CompressionAlgorithm, LedgerStatistics,
    RestoreDraft, RestoreOperationRecord, RestoreStatus, StatusSummary, WalSegmentDraft,
    WalSegmentRecord, WalSequence,
};

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

/// Storage contract for backup, WAL segment and restore records.
///
/// Every write is atomic per record. Backing-store failures surface as
/// [`BackupError::LedgerUnavailable`](crate::BackupError::LedgerUnavailable).
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create tables and indexes; safe to call repeatedly
    async fn initialize_schema(&self) -> Result<()>;

    /// Insert a new backup record, returning its identifier
    async fn create_backup(&self, draft: BackupDraft) -> Result<String>;

    /// Move a backup to `status`, writing `end_time` and any supplied fields
    async fn update_backup_status(
        &self,
        id: &str,
        status: BackupStatus,
        end_time: Option<DateTime<Utc>>,
        fields: BackupUpdate,
    ) -> Result<()>;

    /// Look up one backup
    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>>;

    /// Backups ordered by start time, newest first
    async fn list_backups(
        &self,
        kind: Option<BackupKind>,
        status: Option<BackupStatus>,
        limit: usize,
    ) -> Result<Vec<BackupRecord>>;

    /// Most recently started `completed` backup of `kind`
    async fn get_latest_completed(&self, kind: BackupKind) -> Result<Option<BackupRecord>>;

    /// Record an archived segment; the parent backup must exist
    async fn create_wal_segment(&self, draft: WalSegmentDraft) -> Result<i64>;

    /// Segments of one batch ordered by sequence number ascending
    async fn get_wal_segments_for_backup(&self, backup_id: &str) -> Result<Vec<WalSegmentRecord>>;

    /// Replay chain for a base backup: segments of every completed incremental
    /// batch whose parent is `base_backup_id`, ascending and de-duplicated by sequence
    async fn get_wal_chain(&self, base_backup_id: &str) -> Result<Vec<WalSegmentRecord>>;

    /// Insert a `running` restore operation, returning its identifier
    async fn create_restore_operation(&self, draft: RestoreDraft) -> Result<String>;

    /// Move a restore operation to a terminal status
    async fn update_restore_status(
        &self,
        id: &str,
        status: RestoreStatus,
        end_time: Option<DateTime<Utc>>,
        error_detail: Option<String>,
    ) -> Result<()>;

    /// Look up one restore operation
    async fn get_restore_operation(&self, id: &str) -> Result<Option<RestoreOperationRecord>>;

    /// Restore operations ordered by start time, newest first
    async fn list_restore_operations(&self, limit: usize) -> Result<Vec<RestoreOperationRecord>>;

    /// Tombstone a terminal backup whose remote artifacts were deleted
    async fn mark_purged(&self, id: &str) -> Result<()>;

    /// Counts and sizes per kind and status
    async fn statistics(&self) -> Result<LedgerStatistics>;

    /// Claim `name` for `holder` until `ttl` elapses; `false` if someone else holds it
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give up a lease held by `holder`
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// Lease name guarding backup operations against one source database
pub fn backup_lease_name(database: &str) -> String {
    format!("backup:{}", database)
}

/// Lease name guarding restore operations against one source database
pub fn restore_lease_name(database: &str) -> String {
    format!("restore:{}", database)
}

/// Order by sequence and keep the first copy of each sequence number
pub(crate) fn dedupe_chain(mut segments: Vec<WalSegmentRecord>) -> Vec<WalSegmentRecord> {
    segments.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.id.cmp(&b.id)));
    let mut seen = HashSet::new();
    segments.retain(|s| seen.insert(s.sequence));
    segments
}
