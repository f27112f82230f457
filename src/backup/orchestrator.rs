// Backup orchestrator - full backup pipeline, lease handling and finalisation

use super::types::{BackupOptions, OperationOutcome};
use crate::alerts::{AlertEvent, AlertLevel, AlertSink, TracingAlertSink};
use crate::compression::{compress_file, compressed_path};
use crate::ledger::{
    backup_lease_name, BackupDraft, BackupKind, BackupStatus, BackupUpdate, CompressionAlgorithm, Ledger,
};
use crate::storage::ObjectStoreGateway;
use crate::tools::DumpTool;
use crate::workspace::WorkArea;
use crate::{BackupError, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const VERSION_QUERY_LIMIT: Duration = Duration::from_secs(30);

pub(super) fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub(super) fn default_label(kind: BackupKind) -> String {
    format!("{}-backup-{}", kind, Utc::now().format("%Y%m%d-%H%M%S"))
}

/// Runs full and incremental backups against one source database.
///
/// Every invocation holds the `backup:{database}` lease, always leaves its ledger
/// record in a terminal state and always removes its work area.
pub struct BackupOrchestrator {
    pub(super) ledger: Arc<dyn Ledger>,
    pub(super) gateway: Arc<ObjectStoreGateway>,
    pub(super) dump: Arc<dyn DumpTool>,
    pub(super) options: BackupOptions,
    pub(super) alerts: Arc<dyn AlertSink>,
}

impl BackupOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<ObjectStoreGateway>,
        dump: Arc<dyn DumpTool>,
        options: BackupOptions,
    ) -> Self {
        Self {
            ledger,
            gateway,
            dump,
            options,
            alerts: Arc::new(TracingAlertSink),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    /// Archive directory scanned by incremental backups
    pub fn wal_directory(&self) -> &Path {
        &self.options.wal_directory
    }

    /// Engine version reported by the source server, bounded by the dump timeout capped at 30s
    pub async fn server_version(&self) -> Result<String> {
        let limit = self.options.dump_timeout.min(VERSION_QUERY_LIMIT);
        match tokio::time::timeout(limit, self.dump.server_version()).await {
            Ok(result) => result,
            Err(_) => Err(BackupError::ToolInvocationFailed {
                tool: "version query".to_string(),
                reason: format!("no answer within {}ms", limit.as_millis()),
            }),
        }
    }

    pub(super) async fn alert(&self, level: AlertLevel, message: impl Into<String>, context: Value) {
        self.alerts.send(AlertEvent::new(level, message, context)).await;
    }

    /// Claim the backup lease, returning the holder token
    pub(super) async fn acquire_lease(&self) -> Result<String> {
        let holder = format!("{}-{}", host_name(), uuid::Uuid::new_v4());
        let name = backup_lease_name(&self.options.database);
        if !self.ledger.acquire_lease(&name, &holder, self.options.lease_ttl).await? {
            return Err(BackupError::AlreadyInProgress(name));
        }
        debug!(lease = %name, holder = %holder, "Backup lease acquired");
        Ok(holder)
    }

    pub(super) async fn release_lease(&self, holder: &str) {
        let name = backup_lease_name(&self.options.database);
        if let Err(e) = self.ledger.release_lease(&name, holder).await {
            warn!(lease = %name, error = %e, "Failed to release backup lease");
        }
    }

    /// Record a failed attempt; returns the outcome to hand back
    pub(super) async fn finalize_failed(&self, id: &str, kind: BackupKind, err: &BackupError, extra: Value) -> OperationOutcome {
        let detail = err.to_string();
        error!(backup_id = %id, kind = %kind, error = %detail, "Backup failed");

        let mut metadata = json!({ "error": detail });
        crate::ledger::merge_metadata(&mut metadata, extra);
        let update = BackupUpdate {
            metadata: Some(metadata),
            ..Default::default()
        };

        if let Err(ledger_err) = self
            .ledger
            .update_backup_status(id, BackupStatus::Failed, Some(Utc::now()), update)
            .await
        {
            self.alert(
                AlertLevel::Critical,
                format!("Backup {} failed and could not be recorded", id),
                json!({ "backup_id": id, "kind": kind, "error": detail, "ledger_error": ledger_err.to_string() }),
            )
            .await;
        } else {
            self.alert(
                AlertLevel::Error,
                format!("{} backup failed", kind),
                json!({ "backup_id": id, "kind": kind, "error": detail }),
            )
            .await;
        }

        OperationOutcome::failed(detail, Some(id.to_string()))
    }

    /// Record a completed attempt; a ledger failure turns the outcome into a failure
    pub(super) async fn finalize_completed(&self, id: &str, kind: BackupKind, update: BackupUpdate) -> OperationOutcome {
        let size = update.size_bytes;
        let key = update.remote_key.clone();

        if let Err(e) = self
            .ledger
            .update_backup_status(id, BackupStatus::Completed, Some(Utc::now()), update)
            .await
        {
            error!(backup_id = %id, error = %e, "Uploaded backup could not be marked completed");
            self.alert(
                AlertLevel::Critical,
                format!("Backup {} uploaded but ledger finalisation failed", id),
                json!({ "backup_id": id, "kind": kind, "remote_key": key, "error": e.to_string() }),
            )
            .await;
            return OperationOutcome::failed(e.to_string(), Some(id.to_string()));
        }

        info!(backup_id = %id, kind = %kind, size_bytes = ?size, remote_key = ?key, "Backup completed");
        self.alert(
            AlertLevel::Info,
            format!("{} backup completed", kind),
            json!({ "backup_id": id, "kind": kind, "size_bytes": size, "remote_key": key }),
        )
        .await;
        OperationOutcome::succeeded(id)
    }

    /// Failure before any ledger record exists
    pub(super) async fn abort(&self, kind: BackupKind, err: BackupError) -> OperationOutcome {
        let detail = err.to_string();
        error!(kind = %kind, error = %detail, "Backup aborted");
        self.alert(
            AlertLevel::Error,
            format!("{} backup could not start", kind),
            json!({ "kind": kind, "error": detail }),
        )
        .await;
        OperationOutcome::failed(detail, None)
    }

    /// Take a full snapshot, compress, checksum, upload and record it
    pub async fn create_full_backup(&self, label: Option<&str>, description: Option<&str>) -> OperationOutcome {
        let holder = match self.acquire_lease().await {
            Ok(holder) => holder,
            Err(e) => return self.abort(BackupKind::Full, e).await,
        };

        let outcome = self.run_full(label, description).await;
        self.release_lease(&holder).await;
        outcome
    }

    async fn run_full(&self, label: Option<&str>, description: Option<&str>) -> OperationOutcome {
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| default_label(BackupKind::Full));
        let draft = BackupDraft::running(BackupKind::Full, self.dump.format())
            .with_label(label.clone())
            .with_description(description.unwrap_or("Automated full backup"))
            .with_metadata(json!({ "host": host_name(), "method": "pg_dump" }));

        info!(backup_id = %draft.id, label = %label, "Starting full backup");

        // No tool runs unless the provisional record exists
        let id = match self.ledger.create_backup(draft).await {
            Ok(id) => id,
            Err(e) => return self.abort(BackupKind::Full, e).await,
        };

        let work = match WorkArea::create(self.options.work_dir.as_deref(), "backupctl-full-") {
            Ok(work) => work,
            Err(e) => return self.finalize_failed(&id, BackupKind::Full, &e, json!({})).await,
        };

        let result = self.full_pipeline(&id, &work).await;
        work.release();

        match result {
            Ok(update) => self.finalize_completed(&id, BackupKind::Full, update).await,
            Err(e) => self.finalize_failed(&id, BackupKind::Full, &e, json!({})).await,
        }
    }

    async fn full_pipeline(&self, id: &str, work: &WorkArea) -> Result<BackupUpdate> {
        let format = self.dump.format();
        let raw = work.file(&format!("{}.{}", id, format.extension()));

        let timeout = self.options.dump_timeout;
        match tokio::time::timeout(timeout, self.dump.dump(&raw)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackupError::ToolInvocationFailed {
                    tool: "dump".to_string(),
                    reason: format!("timed out after {}s", timeout.as_secs()),
                })
            }
        }

        let dumped = tokio::fs::metadata(&raw).await.map(|m| m.len()).unwrap_or(0);
        if dumped == 0 {
            return Err(BackupError::ToolInvocationFailed {
                tool: "dump".to_string(),
                reason: "dump produced no output".to_string(),
            });
        }
        debug!(backup_id = %id, size_bytes = dumped, "Dump finished");

        let engine_version = match self.server_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(backup_id = %id, error = %e, "Could not query engine version");
                "unknown".to_string()
            }
        };

        let (artifact, compression) = if self.options.compression_enabled {
            let packed = compressed_path(&raw);
            let compressed = compress_file(&raw, &packed, self.options.compression_level).await;
            match compressed {
                Ok(size) => {
                    debug!(backup_id = %id, before = dumped, after = size, "Artifact compressed");
                    (packed, Some(CompressionAlgorithm::Gzip))
                }
                Err(e) => {
                    warn!(backup_id = %id, error = %e, "Compression failed, uploading uncompressed artifact");
                    (raw, None)
                }
            }
        } else {
            (raw, None)
        };

        let filename = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| BackupError::Config(format!("invalid artifact path {}", artifact.display())))?;

        let receipt = self.gateway.upload(&artifact, BackupKind::Full, &filename).await?;

        Ok(BackupUpdate {
            size_bytes: Some(receipt.size_bytes),
            checksum: Some(receipt.checksum),
            remote_key: Some(receipt.key),
            remote_bucket: Some(self.gateway.bucket().to_string()),
            compression,
            encryption: Some(self.gateway.encryption()),
            metadata: Some(json!({ "engine_version": engine_version })),
            ..Default::default()
        })
    }
}
