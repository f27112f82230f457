// Incremental backups - WAL segment discovery and batch archiving

use super::orchestrator::{default_label, host_name, BackupOrchestrator};
use super::types::{BatchManifest, ManifestEntry, OperationOutcome};
use crate::ledger::{
    ArtifactFormat, BackupDraft, BackupKind, BackupUpdate, WalSegmentDraft, WalSequence,
};
use crate::workspace::WorkArea;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A WAL segment file found in the archive directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSegment {
    pub path: PathBuf,
    /// File name as found, including any `.gz`
    pub name: String,
    pub sequence: WalSequence,
    pub size_bytes: u64,
    /// Last modification time; the segment's interval end
    pub modified: DateTime<Utc>,
}

/// Segment files in `dir`, ascending by sequence.
///
/// A file qualifies when its name up to the first `.` is exactly 24 hex characters.
/// A missing directory yields no segments.
pub async fn discover_wal_segments(dir: &Path) -> Result<Vec<DiscoveredSegment>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %dir.display(), "WAL directory not found");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(sequence) = WalSequence::from_segment_name(&name) else {
            continue;
        };
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        segments.push(DiscoveredSegment {
            path: entry.path(),
            name,
            sequence,
            size_bytes: metadata.len(),
            modified,
        });
    }

    segments.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
    Ok(segments)
}

impl BackupOrchestrator {
    /// Archive every WAL segment in the archive directory as one incremental batch
    pub async fn create_incremental_backup(&self, label: Option<&str>) -> OperationOutcome {
        let holder = match self.acquire_lease().await {
            Ok(holder) => holder,
            Err(e) => return self.abort(BackupKind::Incremental, e).await,
        };

        let outcome = self.run_incremental(label).await;
        self.release_lease(&holder).await;
        outcome
    }

    async fn run_incremental(&self, label: Option<&str>) -> OperationOutcome {
        let wal_dir = self.options.wal_directory.clone();
        let segments = match discover_wal_segments(&wal_dir).await {
            Ok(segments) if segments.is_empty() => {
                let err = BackupError::ToolInvocationFailed {
                    tool: "wal discovery".to_string(),
                    reason: format!("no WAL segments found in {}", wal_dir.display()),
                };
                return self.abort(BackupKind::Incremental, err).await;
            }
            Ok(segments) => segments,
            Err(e) => return self.abort(BackupKind::Incremental, e).await,
        };

        let parent = match self.ledger.get_latest_completed(BackupKind::Full).await {
            Ok(parent) => parent.map(|p| p.id),
            Err(e) => return self.abort(BackupKind::Incremental, e).await,
        };
        if parent.is_none() {
            warn!("No completed full backup; incremental batch has no restore base");
        }

        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| default_label(BackupKind::Incremental));
        let draft = BackupDraft::running(BackupKind::Incremental, ArtifactFormat::WalArchive)
            .with_parent(parent.clone())
            .with_label(label)
            .with_description("Automated incremental backup")
            .with_metadata(json!({
                "host": host_name(),
                "method": "wal_archive",
                "wal_directory": wal_dir.display().to_string(),
            }));
        let batch_start = draft.start_time;

        info!(backup_id = %draft.id, segments = segments.len(), parent = ?parent, "Starting incremental backup");

        // Segment rows reference this record, so it must exist first
        let id = match self.ledger.create_backup(draft).await {
            Ok(id) => id,
            Err(e) => return self.abort(BackupKind::Incremental, e).await,
        };

        let mut archived = Vec::with_capacity(segments.len());
        let mut failed = Vec::new();
        for segment in &segments {
            match self.archive_segment(&id, segment, batch_start).await {
                Ok(entry) => archived.push(entry),
                Err(e) => {
                    warn!(backup_id = %id, segment = %segment.name, error = %e, "Skipping WAL segment");
                    failed.push(segment.name.clone());
                }
            }
        }

        if archived.is_empty() {
            let err = BackupError::TransferFailed(format!(
                "none of {} WAL segments could be archived",
                segments.len()
            ));
            return self
                .finalize_failed(&id, BackupKind::Incremental, &err, json!({ "failed_segments": failed }))
                .await;
        }

        let manifest = BatchManifest {
            backup_id: id.clone(),
            parent_backup_id: parent,
            created_at: Utc::now(),
            segments: archived,
            failed_segments: failed,
        };

        match self.upload_manifest(&manifest).await {
            Ok(update) => self.finalize_completed(&id, BackupKind::Incremental, update).await,
            Err(e) => {
                let extra = json!({ "segment_count": manifest.segments.len(), "segments": manifest.segment_names() });
                self.finalize_failed(&id, BackupKind::Incremental, &e, extra).await
            }
        }
    }

    async fn archive_segment(
        &self,
        backup_id: &str,
        segment: &DiscoveredSegment,
        batch_start: DateTime<Utc>,
    ) -> Result<ManifestEntry> {
        let receipt = self
            .gateway
            .upload_in_batch(&segment.path, BackupKind::Incremental, backup_id, &segment.name)
            .await?;

        let end_time = segment.modified;
        let start_time = batch_start.min(end_time);

        self.ledger
            .create_wal_segment(WalSegmentDraft {
                segment_name: segment.name.clone(),
                backup_id: backup_id.to_string(),
                start_time,
                end_time,
                size_bytes: receipt.size_bytes,
                remote_key: receipt.key.clone(),
                checksum: receipt.checksum.clone(),
                sequence: segment.sequence,
            })
            .await?;

        debug!(backup_id = %backup_id, segment = %segment.name, key = %receipt.key, "WAL segment archived");
        Ok(ManifestEntry {
            segment_name: segment.name.clone(),
            remote_key: receipt.key,
            checksum: receipt.checksum,
            size_bytes: receipt.size_bytes,
            start_time,
            end_time,
        })
    }

    async fn upload_manifest(&self, manifest: &BatchManifest) -> Result<BackupUpdate> {
        let work = WorkArea::create(self.options.work_dir.as_deref(), "backupctl-wal-")?;
        let filename = format!("{}.{}", manifest.backup_id, ArtifactFormat::WalArchive.extension());
        let path = work.file(&filename);

        let body = serde_json::to_vec_pretty(manifest)?;
        tokio::fs::write(&path, body).await?;

        let receipt = self.gateway.upload(&path, BackupKind::Incremental, &filename).await;
        work.release();
        let receipt = receipt?;

        Ok(BackupUpdate {
            size_bytes: Some(manifest.total_bytes()),
            checksum: Some(receipt.checksum),
            remote_key: Some(receipt.key),
            remote_bucket: Some(self.gateway.bucket().to_string()),
            encryption: Some(self.gateway.encryption()),
            metadata: Some(json!({
                "segment_count": manifest.segments.len(),
                "segments": manifest.segment_names(),
                "failed_segments": manifest.failed_segments,
            })),
            ..Default::default()
        })
    }
}
