// Retention - age-based selection and pruning of backup artifacts

use crate::ledger::{BackupKind, BackupRecord, BackupStatus, Ledger};
use crate::storage::ObjectStoreGateway;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum artifact age per backup kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub full_days: i64,
    pub incremental_days: i64,
    /// How many of the most recent records one pass considers
    pub scan_limit: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            full_days: 30,
            incremental_days: 7,
            scan_limit: 1000,
        }
    }
}

impl RetentionPolicy {
    pub fn threshold_days(&self, kind: BackupKind) -> i64 {
        match kind {
            BackupKind::Full => self.full_days,
            BackupKind::Incremental => self.incremental_days,
        }
    }
}

/// A record eligible for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneCandidate {
    pub backup_id: String,
    pub kind: BackupKind,
    /// Whole days between start and the evaluation instant
    pub age_days: i64,
    pub size_bytes: u64,
}

/// A candidate whose objects could not be removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneFailure {
    pub backup_id: String,
    pub reason: String,
}

/// Result of one retention pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub dry_run: bool,
    pub candidates: Vec<PruneCandidate>,
    /// Identifiers deleted and tombstoned; empty on a dry run
    pub deleted: Vec<String>,
    pub failures: Vec<PruneFailure>,
}

impl PruneReport {
    pub fn reclaimable_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size_bytes).sum()
    }
}

/// Records strictly older than their kind's threshold.
///
/// Only `completed` and `failed` records qualify; `running` ones may still be
/// in flight and `purged` ones are already gone.
pub fn select_candidates(
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<PruneCandidate> {
    records
        .iter()
        .filter(|r| matches!(r.status, BackupStatus::Completed | BackupStatus::Failed))
        .filter_map(|r| {
            let age_days = (now - r.start_time).num_days();
            (age_days > policy.threshold_days(r.kind)).then(|| PruneCandidate {
                backup_id: r.id.clone(),
                kind: r.kind,
                age_days,
                size_bytes: r.size_bytes.unwrap_or(0),
            })
        })
        .collect()
}

/// Applies a [`RetentionPolicy`] to the ledger and the object store
pub struct RetentionEngine {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<ObjectStoreGateway>,
    policy: RetentionPolicy,
}

impl RetentionEngine {
    pub fn new(ledger: Arc<dyn Ledger>, gateway: Arc<ObjectStoreGateway>, policy: RetentionPolicy) -> Self {
        Self { ledger, gateway, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub async fn prune(&self, dry_run: bool) -> Result<PruneReport> {
        self.prune_at(Utc::now(), dry_run).await
    }

    /// Prune as of `now`; the candidate list does not depend on `dry_run`
    pub async fn prune_at(&self, now: DateTime<Utc>, dry_run: bool) -> Result<PruneReport> {
        let records = self.ledger.list_backups(None, None, self.policy.scan_limit).await?;
        let candidates = select_candidates(&records, &self.policy, now);

        info!(
            scanned = records.len(),
            candidates = candidates.len(),
            dry_run,
            "Retention pass"
        );

        let mut report = PruneReport {
            dry_run,
            candidates,
            deleted: Vec::new(),
            failures: Vec::new(),
        };
        if dry_run {
            return Ok(report);
        }

        for candidate in &report.candidates {
            let Some(record) = records.iter().find(|r| r.id == candidate.backup_id) else {
                continue;
            };
            match self.purge(record).await {
                Ok(()) => report.deleted.push(record.id.clone()),
                Err(e) => {
                    warn!(backup_id = %record.id, error = %e, "Could not prune backup");
                    report.failures.push(PruneFailure {
                        backup_id: record.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "Retention pass finished"
        );
        Ok(report)
    }

    /// Every remote object belonging to `record`
    async fn object_keys(&self, record: &BackupRecord) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if record.kind == BackupKind::Incremental {
            let segments = self.ledger.get_wal_segments_for_backup(&record.id).await?;
            keys.extend(segments.into_iter().map(|s| s.remote_key));
        }
        // Manifest for batches, the artifact itself for full backups
        keys.extend(record.remote_key.clone());
        Ok(keys)
    }

    async fn purge(&self, record: &BackupRecord) -> Result<()> {
        let keys = self.object_keys(record).await?;
        for key in &keys {
            self.gateway.delete(key).await?;
        }
        debug!(backup_id = %record.id, objects = keys.len(), "Objects removed");

        self.ledger.mark_purged(&record.id).await.map_err(|e| match e {
            BackupError::InvalidTransition { .. } => e,
            other => BackupError::LedgerUnavailable(format!(
                "objects for {} removed but tombstone not written: {}",
                record.id, other
            )),
        })
    }
}
