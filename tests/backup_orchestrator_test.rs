// Integration tests for the backup pipelines
// Runs the real orchestrator against the in-memory ledger and object store

mod common;

use backupctl::alerts::{AlertLevel, RecordingAlertSink};
use backupctl::backup::BatchManifest;
use backupctl::ledger::{
    backup_lease_name, ArtifactFormat, BackupKind, BackupStatus, CompressionAlgorithm, Ledger,
};
use backupctl::storage::EncryptionMode;
use common::{segment_name, FakeDump, Harness};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[tokio::test]
async fn test_full_backup_compresses_checksums_and_records() {
    let harness = Harness::new();
    let dump = Arc::new(FakeDump::new(vec![b'a'; 100]));
    let alerts = Arc::new(RecordingAlertSink::new());
    let orchestrator = harness.backups(dump.clone()).with_alerts(alerts.clone());

    let outcome = orchestrator.create_full_backup(Some("nightly"), None).await;
    assert!(outcome.success, "backup failed: {}", outcome.detail);
    let id = outcome.backup_id.clone().expect("backup id");
    assert_eq!(outcome.detail, id);

    let record = harness.ledger.get_backup(&id).await.unwrap().expect("record");
    assert_eq!(record.kind, BackupKind::Full);
    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.artifact_format, ArtifactFormat::CustomArchive);
    assert_eq!(record.label.as_deref(), Some("nightly"));
    assert_eq!(record.description.as_deref(), Some("Automated full backup"));
    assert_eq!(record.compression, Some(CompressionAlgorithm::Gzip));
    assert_eq!(record.encryption, Some(EncryptionMode::ProviderManaged));
    assert_eq!(record.remote_bucket.as_deref(), Some("pitr-test"));
    assert!(record.end_time.is_some());

    // 100 compressible bytes shrink
    let size = record.size_bytes.expect("size");
    assert!(size > 0 && size < 100, "stored size {}", size);

    let checksum = record.checksum.expect("checksum");
    assert_eq!(checksum.len(), 64);
    assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));

    let key = record.remote_key.expect("remote key");
    assert!(key.starts_with("backups/full/"));
    assert!(key.ends_with(&format!("{}.dump.gz", id)));
    assert_eq!(harness.store.object_bytes(&key).map(|b| b.len() as u64), Some(size));

    assert_eq!(record.metadata["method"], "pg_dump");
    assert_eq!(record.metadata["engine_version"], "PostgreSQL 16.2");

    assert_eq!(dump.calls(), 1);
    assert_eq!(alerts.levels(), vec![AlertLevel::Info]);
    assert!(harness.work_dir_entries().is_empty());
}

#[tokio::test]
async fn test_full_backup_without_compression_uses_raw_artifact() {
    let harness = Harness::new();
    let dump = Arc::new(FakeDump::new(b"-- plain body".to_vec()));
    let options = harness.backup_options().with_compression(false);
    let orchestrator = backupctl::backup::BackupOrchestrator::new(
        harness.ledger.clone(),
        harness.gateway.clone(),
        dump,
        options,
    );

    let outcome = orchestrator.create_full_backup(None, Some("manual")).await;
    assert!(outcome.success);

    let record = harness.ledger.get_backup(&outcome.detail).await.unwrap().unwrap();
    assert_eq!(record.compression, None);
    assert_eq!(record.size_bytes, Some(13));
    assert_eq!(record.description.as_deref(), Some("manual"));
    assert!(record.label.unwrap().starts_with("full-backup-"));
    assert!(record.remote_key.unwrap().ends_with(".dump"));
}

#[tokio::test]
async fn test_dump_timeout_fails_and_cleans_work_area() {
    let harness = Harness::new();
    let dump = Arc::new(FakeDump::new(vec![1u8; 10]).slow(Duration::from_secs(30)));
    let alerts = Arc::new(RecordingAlertSink::new());
    let options = harness.backup_options().with_dump_timeout(Duration::from_millis(100));
    let orchestrator = backupctl::backup::BackupOrchestrator::new(
        harness.ledger.clone(),
        harness.gateway.clone(),
        dump,
        options,
    )
    .with_alerts(alerts.clone());

    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("timed out"), "detail: {}", outcome.detail);

    let id = outcome.backup_id.expect("failed attempts still have a record");
    let record = harness.ledger.get_backup(&id).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
    assert!(record.end_time.is_some());
    assert!(record.metadata["error"].as_str().unwrap().contains("timed out"));

    assert!(harness.work_dir_entries().is_empty());
    assert_eq!(harness.store.object_count(), 0);
    assert_eq!(alerts.levels(), vec![AlertLevel::Error]);
}

#[tokio::test]
async fn test_dump_failure_and_empty_output_are_failures() {
    let harness = Harness::new();

    let failing = harness.backups(Arc::new(FakeDump::new(vec![1u8]).failing()));
    let outcome = failing.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("connection refused"));

    let empty = harness.backups(Arc::new(FakeDump::new(Vec::new())));
    let outcome = empty.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("no output"));

    let failed = harness
        .ledger
        .list_backups(Some(BackupKind::Full), Some(BackupStatus::Failed), 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 2);
    assert!(harness.work_dir_entries().is_empty());
}

#[tokio::test]
async fn test_corrupted_upload_fails_backup() {
    let harness = Harness::new();
    harness.store.set_corrupt_writes(true);
    let orchestrator = harness.backups(Arc::new(FakeDump::new(vec![7u8; 64])));

    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("Integrity mismatch"), "detail: {}", outcome.detail);

    let record = harness.ledger.get_backup(&outcome.backup_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
}

#[tokio::test]
async fn test_unreachable_ledger_aborts_before_dump() {
    let harness = Harness::new();
    harness.ledger.set_unavailable(true);
    let dump = Arc::new(FakeDump::new(vec![1u8; 10]));
    let orchestrator = harness.backups(dump.clone());

    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.backup_id.is_none());
    assert_eq!(dump.calls(), 0);
}

#[tokio::test]
async fn test_lease_excludes_concurrent_backups() {
    let harness = Harness::new();
    let holder_lease = backup_lease_name("postgres");
    assert!(harness
        .ledger
        .acquire_lease(&holder_lease, "other-host", Duration::from_secs(60))
        .await
        .unwrap());

    let dump = Arc::new(FakeDump::new(vec![1u8; 10]));
    let orchestrator = harness.backups(dump.clone());
    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("already in progress"), "detail: {}", outcome.detail);
    assert_eq!(dump.calls(), 0);
    assert!(harness.ledger.list_backups(None, None, 10).await.unwrap().is_empty());

    harness.ledger.release_lease(&holder_lease, "other-host").await.unwrap();
    assert!(orchestrator.create_full_backup(None, None).await.success);
}

#[tokio::test]
async fn test_overlapping_invocations_one_wins() {
    let harness = Harness::new();
    let dump = Arc::new(FakeDump::new(vec![1u8; 10]).slow(Duration::from_millis(200)));
    let orchestrator = harness.backups(dump);

    let (first, second) = tokio::join!(
        orchestrator.create_full_backup(None, None),
        orchestrator.create_incremental_backup(None)
    );
    assert!(first.success);
    assert!(!second.success);
    assert!(second.detail.contains("already in progress"));
}

#[tokio::test]
async fn test_incremental_backup_archives_segments_and_manifest() {
    let harness = Harness::new();
    let orchestrator = harness.backups(Arc::new(FakeDump::new(vec![b'x'; 50])));
    let full = orchestrator.create_full_backup(None, None).await;
    assert!(full.success);

    let now = SystemTime::now();
    for n in [3u64, 1, 2] {
        harness.write_segment(&segment_name(n), &vec![n as u8; 32], now - Duration::from_secs(600 - n * 60));
    }
    std::fs::write(harness.wal_dir().join("archive_status"), b"ignored").unwrap();

    let alerts = Arc::new(RecordingAlertSink::new());
    let orchestrator = orchestrator.with_alerts(alerts.clone());
    let outcome = orchestrator.create_incremental_backup(Some("hourly")).await;
    assert!(outcome.success, "incremental failed: {}", outcome.detail);

    let record = harness.ledger.get_backup(&outcome.detail).await.unwrap().unwrap();
    assert_eq!(record.kind, BackupKind::Incremental);
    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.artifact_format, ArtifactFormat::WalArchive);
    assert_eq!(record.parent_backup_id.as_deref(), Some(full.detail.as_str()));
    assert_eq!(record.size_bytes, Some(96));
    assert_eq!(record.metadata["segment_count"], 3);

    let segments = harness.ledger.get_wal_segments_for_backup(&record.id).await.unwrap();
    let names: Vec<String> = segments.iter().map(|s| s.segment_name.clone()).collect();
    assert_eq!(names, vec![segment_name(1), segment_name(2), segment_name(3)]);
    for segment in &segments {
        assert!(segment.start_time <= segment.end_time);
        assert!(harness.store.object_bytes(&segment.remote_key).is_some());
    }

    let manifest_key = record.remote_key.expect("manifest key");
    assert!(manifest_key.ends_with(&format!("{}.manifest.json", record.id)));
    let manifest: BatchManifest =
        serde_json::from_slice(&harness.store.object_bytes(&manifest_key).unwrap()).unwrap();
    assert_eq!(manifest.backup_id, record.id);
    assert_eq!(manifest.segment_names(), names);
    assert!(manifest.failed_segments.is_empty());

    assert_eq!(alerts.levels(), vec![AlertLevel::Info]);
}

#[tokio::test]
async fn test_incremental_without_segments_creates_no_record() {
    let harness = Harness::new();
    let orchestrator = harness.backups(Arc::new(FakeDump::new(vec![1u8])));

    let outcome = orchestrator.create_incremental_backup(None).await;
    assert!(!outcome.success);
    assert!(outcome.backup_id.is_none());
    assert!(outcome.detail.contains("no WAL segments"));
    assert!(harness.ledger.list_backups(None, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_incremental_with_every_upload_failing_is_failed() {
    let harness = Harness::new();
    harness.write_segment(&segment_name(1), b"wal", SystemTime::now());
    harness.store.set_corrupt_writes(true);
    let orchestrator = harness.backups(Arc::new(FakeDump::new(vec![1u8])));

    let outcome = orchestrator.create_incremental_backup(None).await;
    assert!(!outcome.success);

    let record = harness.ledger.get_backup(&outcome.backup_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
    assert_eq!(record.metadata["failed_segments"][0], segment_name(1));
    assert!(harness.ledger.get_wal_segments_for_backup(&record.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hung_version_query_does_not_stall_backup() {
    let harness = Harness::new();
    let dump = Arc::new(FakeDump::new(vec![7u8; 64]).hanging_version());
    let options = harness.backup_options().with_dump_timeout(Duration::from_millis(200));
    let orchestrator = backupctl::backup::BackupOrchestrator::new(
        harness.ledger.clone(),
        harness.gateway.clone(),
        dump,
        options,
    );

    let outcome = tokio::time::timeout(Duration::from_secs(3), orchestrator.create_full_backup(None, None))
        .await
        .expect("backup finished despite the hung version query");
    assert!(outcome.success, "{}", outcome.detail);

    let record = harness.ledger.get_backup(&outcome.detail).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.metadata["engine_version"], "unknown");
    let running = harness
        .ledger
        .list_backups(None, Some(BackupStatus::Running), 10)
        .await
        .unwrap();
    assert!(running.is_empty());

    let err = orchestrator.server_version().await.unwrap_err();
    assert!(err.to_string().contains("no answer"), "{}", err);
}

#[tokio::test]
async fn test_compression_failure_uploads_raw_artifact() {
    let harness = Harness::new();
    let payload = vec![b'r'; 2048];
    let dump = Arc::new(FakeDump::new(payload.clone()).blocking_compression());
    let orchestrator = harness.backups(dump);

    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(outcome.success, "{}", outcome.detail);

    let record = harness.ledger.get_backup(&outcome.detail).await.unwrap().unwrap();
    assert_eq!(record.compression, None);
    let key = record.remote_key.unwrap();
    assert!(key.ends_with(".dump"), "{}", key);
    assert_eq!(harness.store.object_bytes(&key).unwrap().to_vec(), payload);
    assert_eq!(record.size_bytes, Some(payload.len() as u64));
}

#[tokio::test]
async fn test_ledger_outage_after_upload_is_critical() {
    let harness = Harness::new();
    let dump = Arc::new(FakeDump::new(vec![3u8; 128]).with_ledger_outage(harness.ledger.clone()));
    let alerts = Arc::new(RecordingAlertSink::new());
    let orchestrator = harness.backups(dump).with_alerts(alerts.clone());

    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(!outcome.success);
    assert!(outcome.backup_id.is_some());
    assert!(outcome.detail.contains("unavailable"), "{}", outcome.detail);
    assert_eq!(harness.store.object_count(), 1);
    assert_eq!(alerts.levels(), vec![AlertLevel::Critical]);
}
