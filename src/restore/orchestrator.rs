// Restore orchestrator - resolve base, verify, apply, replay WAL chain, write directives

use super::recovery::RecoveryDirectives;
use super::{RestoreOptions, RestoreOutcome, RestoreRequest};
use crate::alerts::{AlertEvent, AlertLevel, AlertSink, TracingAlertSink};
use crate::compression::{decompress_file, decompressed_path};
use crate::integrity::checksum_file;
use crate::ledger::{
    restore_lease_name, BackupKind, BackupRecord, BackupStatus, CompressionAlgorithm, Ledger, RestoreDraft,
    RestoreOperationRecord, RestoreStatus, WalSegmentRecord,
};
use crate::storage::{DownloadOutcome, ObjectStoreGateway};
use crate::tools::RestoreTool;
use crate::workspace::WorkArea;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Segments applied and skipped during WAL replay
#[derive(Debug, Default)]
struct Replay {
    applied: Vec<String>,
    skipped: Vec<String>,
}

fn timed_out(tool: &str, timeout: Duration) -> BackupError {
    BackupError::ToolInvocationFailed {
        tool: tool.to_string(),
        reason: format!("timed out after {}s", timeout.as_secs()),
    }
}

fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Reconstructs a database from a base backup and, optionally, WAL up to a target time
pub struct RestoreOrchestrator {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<ObjectStoreGateway>,
    tool: Arc<dyn RestoreTool>,
    options: RestoreOptions,
    alerts: Arc<dyn AlertSink>,
}

impl RestoreOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<ObjectStoreGateway>,
        tool: Arc<dyn RestoreTool>,
        options: RestoreOptions,
    ) -> Self {
        Self {
            ledger,
            gateway,
            tool,
            options,
            alerts: Arc::new(TracingAlertSink),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    async fn alert(&self, level: AlertLevel, message: impl Into<String>, context: Value) {
        self.alerts.send(AlertEvent::new(level, message, context)).await;
    }

    /// Look up one restore operation
    pub async fn restore_status(&self, restore_id: &str) -> Result<Option<RestoreOperationRecord>> {
        self.ledger.get_restore_operation(restore_id).await
    }

    /// Recent restore operations, newest first
    pub async fn list_restores(&self, limit: usize) -> Result<Vec<RestoreOperationRecord>> {
        self.ledger.list_restore_operations(limit).await
    }

    /// Pick the base backup: the named one, or the latest completed full backup
    pub async fn resolve_base(&self, backup_id: Option<&str>) -> Result<BackupRecord> {
        let record = match backup_id {
            Some(id) => self
                .ledger
                .get_backup(id)
                .await?
                .ok_or_else(|| BackupError::RecordNotFound(id.to_string()))?,
            None => self
                .ledger
                .get_latest_completed(BackupKind::Full)
                .await?
                .ok_or_else(|| BackupError::NoBackupAvailable("no completed full backup".to_string()))?,
        };

        if record.kind != BackupKind::Full {
            return Err(BackupError::NoBackupAvailable(format!(
                "{} is an incremental batch, not a base backup",
                record.id
            )));
        }
        if record.status != BackupStatus::Completed {
            return Err(BackupError::NoBackupAvailable(format!(
                "{} is {}, not completed",
                record.id, record.status
            )));
        }
        Ok(record)
    }

    /// Run one restore end to end
    pub async fn restore(&self, request: RestoreRequest) -> RestoreOutcome {
        let lease = restore_lease_name(&self.options.database);
        let holder = format!("restore-{}", uuid::Uuid::new_v4());
        match self.ledger.acquire_lease(&lease, &holder, self.options.lease_ttl).await {
            Ok(true) => {}
            Ok(false) => return self.abort(BackupError::AlreadyInProgress(lease), None).await,
            Err(e) => return self.abort(e, None).await,
        }

        let outcome = self.run(request).await;

        if let Err(e) = self.ledger.release_lease(&lease, &holder).await {
            warn!(lease = %lease, error = %e, "Failed to release restore lease");
        }
        outcome
    }

    async fn abort(&self, err: BackupError, backup_id: Option<String>) -> RestoreOutcome {
        let detail = err.to_string();
        error!(error = %detail, "Restore could not start");
        self.alert(
            AlertLevel::Error,
            "Restore could not start",
            json!({ "backup_id": backup_id, "error": detail }),
        )
        .await;
        RestoreOutcome::failed(detail, None, backup_id)
    }

    async fn run(&self, request: RestoreRequest) -> RestoreOutcome {
        let base = match self.resolve_base(request.backup_id.as_deref()).await {
            Ok(base) => base,
            Err(e) => return self.abort(e, request.backup_id.clone()).await,
        };

        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| self.options.destination_root.clone());
        let draft = RestoreDraft::new(
            base.id.clone(),
            request.target_time,
            destination.display().to_string(),
        );

        info!(
            restore_id = %draft.id,
            backup_id = %base.id,
            target_time = ?request.target_time,
            destination = %destination.display(),
            "Starting restore"
        );

        let restore_id = match self.ledger.create_restore_operation(draft).await {
            Ok(id) => id,
            Err(e) => return self.abort(e, Some(base.id.clone())).await,
        };

        let result = match WorkArea::create(self.options.work_dir.as_deref(), "backupctl-restore-") {
            Ok(work) => {
                let result = self.pipeline(&base, request.target_time, &destination, &work).await;
                work.release();
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(replay) => self.finalize(&restore_id, &base, replay).await,
            Err(e) => self.finalize_failed(&restore_id, &base, e).await,
        }
    }

    async fn finalize(&self, restore_id: &str, base: &BackupRecord, replay: Replay) -> RestoreOutcome {
        let status = if replay.skipped.is_empty() {
            RestoreStatus::Completed
        } else {
            RestoreStatus::Partial
        };
        let detail = (!replay.skipped.is_empty())
            .then(|| format!("skipped WAL segments: {}", replay.skipped.join(", ")));

        if let Err(e) = self
            .ledger
            .update_restore_status(restore_id, status, Some(Utc::now()), detail)
            .await
        {
            error!(restore_id = %restore_id, error = %e, "Restore finished but could not be recorded");
            self.alert(
                AlertLevel::Critical,
                format!("Restore {} finished but ledger finalisation failed", restore_id),
                json!({ "restore_id": restore_id, "backup_id": base.id, "error": e.to_string() }),
            )
            .await;
            return RestoreOutcome {
                success: false,
                detail: e.to_string(),
                restore_id: Some(restore_id.to_string()),
                backup_id: Some(base.id.clone()),
                status: None,
                applied: replay.applied,
                skipped: replay.skipped,
            };
        }

        let level = if status == RestoreStatus::Completed {
            AlertLevel::Info
        } else {
            AlertLevel::Warning
        };
        info!(
            restore_id = %restore_id,
            backup_id = %base.id,
            status = %status,
            applied = replay.applied.len(),
            skipped = replay.skipped.len(),
            "Restore finished"
        );
        self.alert(
            level,
            format!("Restore {}", status),
            json!({
                "restore_id": restore_id,
                "backup_id": base.id,
                "applied": replay.applied,
                "skipped": replay.skipped,
            }),
        )
        .await;

        RestoreOutcome {
            success: true,
            detail: restore_id.to_string(),
            restore_id: Some(restore_id.to_string()),
            backup_id: Some(base.id.clone()),
            status: Some(status),
            applied: replay.applied,
            skipped: replay.skipped,
        }
    }

    async fn finalize_failed(&self, restore_id: &str, base: &BackupRecord, err: BackupError) -> RestoreOutcome {
        let detail = err.to_string();
        error!(restore_id = %restore_id, backup_id = %base.id, error = %detail, "Restore failed");

        let level = match self
            .ledger
            .update_restore_status(restore_id, RestoreStatus::Failed, Some(Utc::now()), Some(detail.clone()))
            .await
        {
            Ok(()) => AlertLevel::Error,
            Err(e) => {
                error!(restore_id = %restore_id, error = %e, "Failed restore could not be recorded");
                AlertLevel::Critical
            }
        };
        self.alert(
            level,
            "Restore failed",
            json!({ "restore_id": restore_id, "backup_id": base.id, "error": detail }),
        )
        .await;

        RestoreOutcome::failed(detail, Some(restore_id.to_string()), Some(base.id.clone()))
    }

    async fn pipeline(
        &self,
        base: &BackupRecord,
        target_time: Option<DateTime<Utc>>,
        destination: &Path,
        work: &WorkArea,
    ) -> Result<Replay> {
        let artifact = self.fetch_base(base, work).await?;
        tokio::fs::create_dir_all(destination).await?;

        let timeout = self.options.base_timeout;
        match tokio::time::timeout(timeout, self.tool.apply_base(&artifact, base.artifact_format, destination)).await {
            Ok(result) => result?,
            Err(_) => return Err(timed_out("restore", timeout)),
        }
        info!(backup_id = %base.id, "Base backup applied");

        let replay = match target_time {
            Some(target) => self.replay_wal(base, target, destination, work).await?,
            None => Replay::default(),
        };

        RecoveryDirectives::new(destination, target_time, self.options.standby)
            .write(destination)
            .await?;
        Ok(replay)
    }

    /// Download, double-verify and decompress the base artifact
    async fn fetch_base(&self, base: &BackupRecord, work: &WorkArea) -> Result<PathBuf> {
        let key = base
            .remote_key
            .as_deref()
            .ok_or_else(|| BackupError::NoBackupAvailable(format!("{} has no remote artifact", base.id)))?;

        let local = work.file(file_name_of(key));
        let download = self.gateway.download(key, &local).await?;

        if let Some(expected) = base.checksum.as_deref() {
            self.check_against_ledger(key, &local, download, expected).await?;
        }

        if base.compression == Some(CompressionAlgorithm::Gzip) {
            let unpacked = decompressed_path(&local).unwrap_or_else(|| local.with_extension("raw"));
            decompress_file(&local, &unpacked).await?;
            debug!(backup_id = %base.id, path = %unpacked.display(), "Base artifact decompressed");
            return Ok(unpacked);
        }
        Ok(local)
    }

    /// Compare a downloaded file with the checksum the ledger recorded at backup time.
    ///
    /// Objects stored without checksum metadata are hashed here with the gateway's algorithm.
    async fn check_against_ledger(
        &self,
        key: &str,
        local: &Path,
        download: DownloadOutcome,
        expected: &str,
    ) -> Result<()> {
        let actual = match download.checksum {
            Some(checksum) => checksum,
            None => checksum_file(local, self.gateway.checksum_algorithm()).await?,
        };
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(BackupError::IntegrityMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Apply chain segments in sequence order until one ends after `target`
    async fn replay_wal(
        &self,
        base: &BackupRecord,
        target: DateTime<Utc>,
        destination: &Path,
        work: &WorkArea,
    ) -> Result<Replay> {
        let chain = self.ledger.get_wal_chain(&base.id).await?;
        info!(backup_id = %base.id, chain_length = chain.len(), target = %target, "Replaying WAL chain");

        let mut replay = Replay::default();
        for segment in chain {
            if segment.end_time > target {
                debug!(segment = %segment.segment_name, "Segment ends after target, stopping");
                break;
            }

            match self.apply_segment(&segment, destination, work).await {
                Ok(()) => replay.applied.push(segment.segment_name),
                Err(e) => {
                    warn!(segment = %segment.segment_name, error = %e, "Skipping WAL segment");
                    replay.skipped.push(segment.segment_name);
                }
            }
        }
        Ok(replay)
    }

    async fn apply_segment(&self, segment: &WalSegmentRecord, destination: &Path, work: &WorkArea) -> Result<()> {
        let local = work.file(&segment.segment_name);
        let download = self.gateway.download(&segment.remote_key, &local).await?;

        self.check_against_ledger(&segment.remote_key, &local, download, &segment.checksum)
            .await?;

        let timeout = self.options.segment_timeout;
        match tokio::time::timeout(
            timeout,
            self.tool.apply_wal_segment(&local, &segment.segment_name, destination),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(timed_out("wal apply", timeout)),
        }

        // Segment files can be large; drop each once staged
        if let Err(e) = tokio::fs::remove_file(&local).await {
            debug!(path = %local.display(), error = %e, "Could not remove downloaded segment");
        }
        Ok(())
    }
}
