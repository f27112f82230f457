// Integration tests for retention and pruning

mod common;

use backupctl::ledger::{BackupKind, BackupStatus, Ledger};
use backupctl::retention::{RetentionEngine, RetentionPolicy};
use chrono::Duration;
use common::{segment_name, FakeDump, Harness};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::SystemTime;

/// One full backup and one two-segment batch
async fn seeded() -> (Harness, String, String) {
    let harness = Harness::new();
    let orchestrator = harness.backups(Arc::new(FakeDump::new(vec![b'z'; 256])));
    let full = orchestrator.create_full_backup(None, None).await;
    assert!(full.success);

    let now = SystemTime::now();
    harness.write_segment(&segment_name(1), b"one", now);
    harness.write_segment(&segment_name(2), b"two", now);
    let batch = orchestrator.create_incremental_backup(None).await;
    assert!(batch.success);

    (harness, full.detail, batch.detail)
}

fn engine(harness: &Harness) -> RetentionEngine {
    RetentionEngine::new(harness.ledger.clone(), harness.gateway.clone(), RetentionPolicy::default())
}

#[tokio::test]
async fn test_age_boundaries_per_kind() {
    let (harness, full_id, batch_id) = seeded().await;
    let full = harness.ledger.get_backup(&full_id).await.unwrap().unwrap();
    let batch = harness.ledger.get_backup(&batch_id).await.unwrap().unwrap();
    let engine = engine(&harness);

    // Exactly at the threshold nothing is old enough
    let report = engine.prune_at(batch.start_time + Duration::days(7), true).await.unwrap();
    assert!(report.candidates.is_empty());

    // One day past the incremental threshold
    let report = engine.prune_at(batch.start_time + Duration::days(8), true).await.unwrap();
    let ids: Vec<&str> = report.candidates.iter().map(|c| c.backup_id.as_str()).collect();
    assert_eq!(ids, vec![batch_id.as_str()]);
    assert_eq!(report.candidates[0].kind, BackupKind::Incremental);
    assert_eq!(report.candidates[0].age_days, 8);

    let report = engine.prune_at(full.start_time + Duration::days(30), true).await.unwrap();
    assert!(report.candidates.iter().all(|c| c.kind == BackupKind::Incremental));

    let report = engine.prune_at(full.start_time + Duration::days(31), true).await.unwrap();
    assert!(report.candidates.iter().any(|c| c.backup_id == full_id && c.age_days == 31));
}

#[tokio::test]
async fn test_dry_run_reports_same_candidates_and_deletes_nothing() {
    let (harness, full_id, batch_id) = seeded().await;
    let engine = engine(&harness);
    let later = chrono::Utc::now() + Duration::days(40);
    let objects_before = harness.store.object_count();

    let dry = engine.prune_at(later, true).await.unwrap();
    assert!(dry.dry_run);
    assert!(dry.deleted.is_empty());
    assert_eq!(harness.store.object_count(), objects_before);
    assert_eq!(dry.candidates.len(), 2);

    let real = engine.prune_at(later, false).await.unwrap();
    assert!(!real.dry_run);
    assert_eq!(real.candidates, dry.candidates);
    assert_eq!(real.reclaimable_bytes(), dry.reclaimable_bytes());
    assert!(real.failures.is_empty());

    let mut deleted = real.deleted.clone();
    deleted.sort();
    let mut expected = vec![full_id.clone(), batch_id.clone()];
    expected.sort();
    assert_eq!(deleted, expected);

    // Segments, manifest and the full artifact are all gone
    assert_eq!(harness.store.object_count(), 0);
    for id in [&full_id, &batch_id] {
        let record = harness.ledger.get_backup(id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Purged);
    }

    // Tombstoned records are never candidates again
    let again = engine.prune_at(later, false).await.unwrap();
    assert!(again.candidates.is_empty());
}

#[tokio::test]
async fn test_failed_deletion_leaves_record_for_retry() {
    let (harness, full_id, _batch_id) = seeded().await;
    let engine = RetentionEngine::new(
        harness.ledger.clone(),
        harness.gateway.clone(),
        RetentionPolicy {
            incremental_days: 365,
            ..RetentionPolicy::default()
        },
    );
    let later = chrono::Utc::now() + Duration::days(40);

    harness.store.set_failing_deletes(true);
    let report = engine.prune_at(later, false).await.unwrap();
    assert_eq!(report.candidates.len(), 1);
    assert!(report.deleted.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].backup_id, full_id);

    let record = harness.ledger.get_backup(&full_id).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Completed);

    harness.store.set_failing_deletes(false);
    let retry = engine.prune_at(later, false).await.unwrap();
    assert_eq!(retry.deleted, vec![full_id.clone()]);
}

#[tokio::test]
async fn test_failed_backups_are_pruned_too() {
    let harness = Harness::new();
    let orchestrator = harness.backups(Arc::new(FakeDump::new(Vec::new())));
    let outcome = orchestrator.create_full_backup(None, None).await;
    assert!(!outcome.success);
    let id = outcome.backup_id.unwrap();

    let report = engine(&harness)
        .prune_at(chrono::Utc::now() + Duration::days(31), false)
        .await
        .unwrap();
    assert_eq!(report.deleted, vec![id.clone()]);
    assert_eq!(report.candidates[0].size_bytes, 0);

    let record = harness.ledger.get_backup(&id).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Purged);
}

#[tokio::test]
async fn test_unreachable_ledger_is_an_error() {
    let harness = Harness::new();
    harness.ledger.set_unavailable(true);
    assert!(engine(&harness).prune(true).await.is_err());
}

#[tokio::test]
async fn test_pruning_older_batch_keeps_objects_of_newer_batch() {
    let harness = Harness::new();
    let orchestrator = harness.backups(Arc::new(FakeDump::new(vec![b'z'; 256])));
    assert!(orchestrator.create_full_backup(None, None).await.success);

    // The same segment is still in the archive directory for both runs
    harness.write_segment(&segment_name(1), b"one", SystemTime::now());
    let older = orchestrator.create_incremental_backup(None).await;
    let newer = orchestrator.create_incremental_backup(None).await;
    assert!(older.success && newer.success);

    let older_segments = harness.ledger.get_wal_segments_for_backup(&older.detail).await.unwrap();
    let newer_segments = harness.ledger.get_wal_segments_for_backup(&newer.detail).await.unwrap();
    assert_ne!(older_segments[0].remote_key, newer_segments[0].remote_key);

    let older_record = harness.ledger.get_backup(&older.detail).await.unwrap().unwrap();
    let report = engine(&harness)
        .prune_at(older_record.start_time + Duration::days(8), false)
        .await
        .unwrap();
    assert_eq!(report.deleted, vec![older.detail.clone()]);

    let newer_record = harness.ledger.get_backup(&newer.detail).await.unwrap().unwrap();
    assert_eq!(newer_record.status, BackupStatus::Completed);
    assert!(harness.store.object_bytes(&newer_segments[0].remote_key).is_some());
    assert!(harness.store.object_bytes(&older_segments[0].remote_key).is_none());
}
