// Integration tests for point-in-time restore
// Backups are produced by the real orchestrator, then restored through the fake apply tool

mod common;

use backupctl::alerts::{AlertLevel, RecordingAlertSink};
use backupctl::backup::BackupOrchestrator;
use backupctl::integrity::ChecksumAlgorithm;
use backupctl::ledger::{restore_lease_name, Ledger, RestoreStatus};
use backupctl::restore::recovery::RECOVERY_CONF;
use backupctl::restore::{RestoreOrchestrator, RestoreRequest};
use backupctl::storage::{EncryptionMode, EncryptionSettings, ObjectStore, ObjectStoreGateway};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{segment_name, FakeDump, FakeRestore, Harness, RESTORED_BASE};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const BASE_BYTES: &[u8] = &[b'a'; 100];

/// A completed full backup followed by one batch of three segments
/// ending 3h, 2h and 1h before `now`
struct Fixture {
    harness: Harness,
    base_id: String,
    batch_id: String,
    now: DateTime<Utc>,
}

impl Fixture {
    async fn new() -> Self {
        let harness = Harness::new();
        let orchestrator = harness.backups(Arc::new(FakeDump::new(BASE_BYTES.to_vec())));
        let full = orchestrator.create_full_backup(Some("base"), None).await;
        assert!(full.success, "{}", full.detail);

        let now = SystemTime::now();
        for hours in 1..=3u64 {
            let n = 4 - hours;
            harness.write_segment(
                &segment_name(n),
                format!("wal segment {}", n).as_bytes(),
                now - Duration::from_secs(hours * 3600),
            );
        }
        let batch = orchestrator.create_incremental_backup(None).await;
        assert!(batch.success, "{}", batch.detail);

        Self {
            harness,
            base_id: full.detail,
            batch_id: batch.detail,
            now: DateTime::<Utc>::from(now),
        }
    }

    fn hours_ago(&self, hours: f64) -> DateTime<Utc> {
        self.now - ChronoDuration::seconds((hours * 3600.0) as i64)
    }

    fn tool(&self) -> Arc<FakeRestore> {
        Arc::new(FakeRestore::new())
    }

    /// Replace the object at `key` with `body` and no checksum metadata
    async fn overwrite_without_metadata(&self, key: &str, body: &[u8]) {
        let forged = self.harness.root.path().join("forged");
        std::fs::write(&forged, body).unwrap();
        put_bare(&self.harness, key, &forged).await;
    }

    async fn segment_key(&self, n: u64) -> String {
        self.harness
            .ledger
            .get_wal_segments_for_backup(&self.batch_id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.segment_name == segment_name(n))
            .expect("segment row")
            .remote_key
    }
}

async fn put_bare(harness: &Harness, key: &str, path: &Path) {
    harness
        .store
        .put_file(key, path, &HashMap::new(), &EncryptionSettings::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_restore_latest_reproduces_base_bytes() {
    let fixture = Fixture::new().await;
    let tool = fixture.tool();
    let alerts = Arc::new(RecordingAlertSink::new());
    let restores = fixture.harness.restores(tool.clone()).with_alerts(alerts.clone());

    let outcome = restores.restore(RestoreRequest::latest()).await;
    assert!(outcome.success, "{}", outcome.detail);
    assert_eq!(outcome.status, Some(RestoreStatus::Completed));
    assert_eq!(outcome.backup_id.as_deref(), Some(fixture.base_id.as_str()));
    assert!(outcome.applied.is_empty());

    let destination = fixture.harness.destination();
    assert_eq!(std::fs::read(destination.join(RESTORED_BASE)).unwrap(), BASE_BYTES);

    let conf = std::fs::read_to_string(destination.join(RECOVERY_CONF)).unwrap();
    assert!(conf.contains("restore_command"));
    assert!(!conf.contains("recovery_target_time"));
    assert!(destination.join("recovery.signal").exists());

    let record = restores
        .restore_status(outcome.restore_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RestoreStatus::Completed);
    assert!(record.end_time.is_some());
    assert_eq!(record.destination_path, destination.display().to_string());

    assert_eq!(alerts.levels(), vec![AlertLevel::Info]);
    assert!(fixture.harness.work_dir_entries().is_empty());
}

#[tokio::test]
async fn test_target_before_every_segment_applies_none() {
    let fixture = Fixture::new().await;
    let tool = fixture.tool();
    let restores = fixture.harness.restores(tool.clone());

    let target = fixture.hours_ago(4.0);
    let outcome = restores
        .restore(RestoreRequest::latest().with_target_time(target))
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.status, Some(RestoreStatus::Completed));
    assert!(outcome.applied.is_empty());
    assert!(tool.applied().is_empty());

    let conf = std::fs::read_to_string(fixture.harness.destination().join(RECOVERY_CONF)).unwrap();
    assert!(conf.contains("recovery_target_time"));
}

#[tokio::test]
async fn test_target_after_all_segments_applies_in_order() {
    let fixture = Fixture::new().await;
    let tool = fixture.tool();
    let restores = fixture.harness.restores(tool.clone());

    let outcome = restores
        .restore(
            RestoreRequest::latest()
                .with_backup_id(fixture.base_id.clone())
                .with_target_time(fixture.now),
        )
        .await;
    assert!(outcome.success, "{}", outcome.detail);

    let expected = vec![segment_name(1), segment_name(2), segment_name(3)];
    assert_eq!(outcome.applied, expected);
    assert_eq!(tool.applied(), expected);
    assert!(outcome.skipped.is_empty());

    let staged = fixture.harness.destination().join("wal_archive");
    for name in &expected {
        assert!(staged.join(name).exists(), "{} not staged", name);
    }
    assert_eq!(
        std::fs::read(staged.join(segment_name(2))).unwrap(),
        b"wal segment 2".to_vec()
    );
}

#[tokio::test]
async fn test_target_between_segments_stops_at_first_later_end() {
    let fixture = Fixture::new().await;
    let restores = fixture.harness.restores(fixture.tool());

    let outcome = restores
        .restore(RestoreRequest::latest().with_target_time(fixture.hours_ago(1.5)))
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.applied, vec![segment_name(1), segment_name(2)]);
}

#[tokio::test]
async fn test_missing_segment_yields_partial() {
    let fixture = Fixture::new().await;
    let key = fixture.segment_key(2).await;
    assert!(fixture.harness.store.remove_object(&key));

    let alerts = Arc::new(RecordingAlertSink::new());
    let restores = fixture.harness.restores(fixture.tool()).with_alerts(alerts.clone());
    let outcome = restores
        .restore(RestoreRequest::latest().with_target_time(fixture.now))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.status, Some(RestoreStatus::Partial));
    assert_eq!(outcome.applied, vec![segment_name(1), segment_name(3)]);
    assert_eq!(outcome.skipped, vec![segment_name(2)]);

    let record = fixture
        .harness
        .ledger
        .get_restore_operation(outcome.restore_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RestoreStatus::Partial);
    assert!(record.error_detail.unwrap().contains(&segment_name(2)));
    assert_eq!(alerts.levels(), vec![AlertLevel::Warning]);
}

#[tokio::test]
async fn test_corrupt_or_rejected_segments_are_skipped() {
    let fixture = Fixture::new().await;
    let key = fixture.segment_key(1).await;
    assert!(fixture.harness.store.corrupt_object(&key));

    let tool = fixture.tool();
    tool.fail_segment(&segment_name(3));
    let restores = fixture.harness.restores(tool.clone());
    let outcome = restores
        .restore(RestoreRequest::latest().with_target_time(fixture.now))
        .await;

    assert_eq!(outcome.status, Some(RestoreStatus::Partial));
    assert_eq!(outcome.applied, vec![segment_name(2)]);
    assert_eq!(outcome.skipped, vec![segment_name(1), segment_name(3)]);
}

#[tokio::test]
async fn test_unknown_backup_id_is_record_not_found() {
    let fixture = Fixture::new().await;
    let restores = fixture.harness.restores(fixture.tool());

    let outcome = restores
        .restore(RestoreRequest::latest().with_backup_id("does-not-exist"))
        .await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("Record not found"), "{}", outcome.detail);
    assert!(outcome.restore_id.is_none());
    assert!(outcome.status.is_none());
    assert!(restores.list_restores(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_incremental_record_is_not_a_base() {
    let fixture = Fixture::new().await;
    let restores = fixture.harness.restores(fixture.tool());

    let outcome = restores
        .restore(RestoreRequest::latest().with_backup_id(fixture.batch_id.clone()))
        .await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("No backup available"), "{}", outcome.detail);
}

#[tokio::test]
async fn test_no_completed_full_backup() {
    let harness = Harness::new();
    let restores = harness.restores(Arc::new(FakeRestore::new()));

    let outcome = restores.restore(RestoreRequest::latest()).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("No backup available"));
    assert!(outcome.restore_id.is_none());
}

#[tokio::test]
async fn test_corrupt_base_fails_restore_record() {
    let fixture = Fixture::new().await;
    let base = fixture.harness.ledger.get_backup(&fixture.base_id).await.unwrap().unwrap();
    assert!(fixture.harness.store.corrupt_object(base.remote_key.as_deref().unwrap()));

    let alerts = Arc::new(RecordingAlertSink::new());
    let tool = fixture.tool();
    let restores = fixture.harness.restores(tool.clone()).with_alerts(alerts.clone());
    let outcome = restores.restore(RestoreRequest::latest()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status, Some(RestoreStatus::Failed));
    assert!(tool.base_formats.lock().is_empty());

    let record = restores
        .restore_status(outcome.restore_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RestoreStatus::Failed);
    assert!(record.error_detail.unwrap().contains("Integrity mismatch"));
    assert_eq!(alerts.levels(), vec![AlertLevel::Error]);
    assert!(fixture.harness.work_dir_entries().is_empty());
}

#[tokio::test]
async fn test_restore_lease_is_exclusive() {
    let fixture = Fixture::new().await;
    let lease = restore_lease_name("postgres");
    assert!(fixture
        .harness
        .ledger
        .acquire_lease(&lease, "elsewhere", Duration::from_secs(60))
        .await
        .unwrap());

    let restores = fixture.harness.restores(fixture.tool());
    let outcome = restores.restore(RestoreRequest::latest()).await;
    assert!(!outcome.success);
    assert!(outcome.detail.contains("already in progress"));
}

#[tokio::test]
async fn test_standby_directives_and_custom_destination() {
    let fixture = Fixture::new().await;
    let destination = fixture.harness.root.path().join("standby");
    let options = backupctl::restore::RestoreOptions {
        standby: true,
        ..fixture.harness.restore_options()
    };
    let restores = backupctl::restore::RestoreOrchestrator::new(
        fixture.harness.ledger.clone(),
        fixture.harness.gateway.clone(),
        Arc::new(FakeRestore::new()),
        options,
    );

    let outcome = restores
        .restore(RestoreRequest::latest().with_destination(destination.clone()))
        .await;
    assert!(outcome.success);
    assert_eq!(std::fs::read(destination.join(RESTORED_BASE)).unwrap(), BASE_BYTES);
    assert!(!fixture.harness.destination().join(RESTORED_BASE).exists());
    assert!(destination.join("standby.signal").exists());
    let conf = std::fs::read_to_string(destination.join(RECOVERY_CONF)).unwrap();
    assert!(conf.ends_with("standby_mode = on\n"));
}

#[tokio::test]
async fn test_segment_without_checksum_metadata_is_checked_against_ledger() {
    let fixture = Fixture::new().await;
    let key = fixture.segment_key(1).await;
    fixture.overwrite_without_metadata(&key, b"CORRUPT!").await;

    let restores = fixture.harness.restores(fixture.tool());
    let outcome = restores
        .restore(RestoreRequest::latest().with_target_time(fixture.now))
        .await;

    assert_eq!(outcome.status, Some(RestoreStatus::Partial));
    assert_eq!(outcome.skipped, vec![segment_name(1)]);
    assert_eq!(outcome.applied, vec![segment_name(2), segment_name(3)]);
    let staged = fixture.harness.destination().join("wal_archive");
    assert!(!staged.join(segment_name(1)).exists());
}

#[tokio::test]
async fn test_sha512_base_without_metadata_is_verified_with_sha512() {
    let harness = Harness::new();
    let gateway = Arc::new(
        ObjectStoreGateway::new(harness.store.clone(), "backups", EncryptionMode::ProviderManaged)
            .with_checksum_algorithm(ChecksumAlgorithm::Sha512),
    );
    let backups = BackupOrchestrator::new(
        harness.ledger.clone(),
        gateway.clone(),
        Arc::new(FakeDump::new(BASE_BYTES.to_vec())),
        harness.backup_options(),
    );
    let full = backups.create_full_backup(None, None).await;
    assert!(full.success, "{}", full.detail);

    let record = harness.ledger.get_backup(&full.detail).await.unwrap().unwrap();
    assert_eq!(record.checksum.as_deref().map(str::len), Some(128));
    let key = record.remote_key.unwrap();
    let copy = harness.root.path().join("artifact-copy");
    std::fs::write(&copy, harness.store.object_bytes(&key).unwrap()).unwrap();
    put_bare(&harness, &key, &copy).await;

    let restores = RestoreOrchestrator::new(
        harness.ledger.clone(),
        gateway,
        Arc::new(FakeRestore::new()),
        harness.restore_options(),
    );
    let outcome = restores.restore(RestoreRequest::latest()).await;
    assert!(outcome.success, "{}", outcome.detail);
    assert_eq!(std::fs::read(harness.destination().join(RESTORED_BASE)).unwrap(), BASE_BYTES);
}

#[tokio::test]
async fn test_ledger_outage_at_restore_finalisation_is_critical() {
    let fixture = Fixture::new().await;
    let alerts = Arc::new(RecordingAlertSink::new());
    let tool = Arc::new(FakeRestore::with_ledger_outage(fixture.harness.ledger.clone()));
    let restores = fixture.harness.restores(tool).with_alerts(alerts.clone());

    let outcome = restores.restore(RestoreRequest::latest()).await;
    assert!(!outcome.success);
    assert!(outcome.restore_id.is_some());
    assert_eq!(outcome.status, None);
    assert!(outcome.detail.contains("unavailable"), "{}", outcome.detail);
    assert_eq!(alerts.levels(), vec![AlertLevel::Critical]);
    assert!(fixture.harness.destination().join(RESTORED_BASE).exists());
}
