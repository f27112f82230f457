// Service facade - one object per deployment wiring ledger, store, tools and policies

use crate::backup::{BackupOrchestrator, OperationOutcome};
use crate::config::Settings;
use crate::ledger::{BackupKind, BackupRecord, BackupStatus, Ledger, LedgerStatistics, RestoreOperationRecord, WalSegmentRecord};
use crate::restore::{RestoreOrchestrator, RestoreOutcome, RestoreRequest};
use crate::retention::{PruneReport, RetentionEngine};
use crate::schedule::{describe_next_invocations, Invocation, ScheduleConfig};
use crate::storage::{BucketUsage, ObjectStore, ObjectStoreGateway};
use crate::tools::{DumpTool, RestoreTool};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Ledger counts joined with object store usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub ledger: LedgerStatistics,
    /// `None` when the store could not be listed
    pub storage: Option<BucketUsage>,
}

/// A backup record with its archived segments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDetails {
    pub record: BackupRecord,
    pub segments: Vec<WalSegmentRecord>,
}

/// Outcome of one connectivity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityCheck {
    pub component: String,
    pub ok: bool,
    pub detail: String,
}

impl ConnectivityCheck {
    fn from_result<T>(component: &str, result: Result<T>, describe: impl FnOnce(T) -> String) -> Self {
        match result {
            Ok(value) => Self {
                component: component.to_string(),
                ok: true,
                detail: describe(value),
            },
            Err(e) => Self {
                component: component.to_string(),
                ok: false,
                detail: e.to_string(),
            },
        }
    }
}

/// Entry points for the command line and the periodic scheduler
pub struct BackupService {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<ObjectStoreGateway>,
    backups: BackupOrchestrator,
    restores: RestoreOrchestrator,
    retention: RetentionEngine,
    schedule: ScheduleConfig,
}

impl BackupService {
    /// Wire components built by the caller, taking policies from `settings`
    pub fn new(
        settings: &Settings,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ObjectStore>,
        dump: Arc<dyn DumpTool>,
        restore_tool: Arc<dyn RestoreTool>,
    ) -> Self {
        let mut gateway = ObjectStoreGateway::new(store, settings.storage.prefix.clone(), settings.storage.encryption);
        if let Some(key_id) = &settings.storage.kms_key_id {
            gateway = gateway.with_kms_key_id(key_id.clone());
        }
        let gateway = Arc::new(gateway);

        let backups = BackupOrchestrator::new(
            ledger.clone(),
            gateway.clone(),
            dump,
            settings.backup.to_options(&settings.source),
        );
        let restores = RestoreOrchestrator::new(
            ledger.clone(),
            gateway.clone(),
            restore_tool,
            settings.restore.to_options(&settings.source),
        );
        let retention = RetentionEngine::new(ledger.clone(), gateway.clone(), settings.retention.clone());

        Self {
            ledger,
            gateway,
            backups,
            restores,
            retention,
            schedule: settings.schedule.clone(),
        }
    }

    /// Connect to the PostgreSQL ledger and S3, then wire the command-line tools
    #[cfg(feature = "s3")]
    pub async fn connect(settings: &Settings) -> Result<Self> {
        use crate::ledger::{ArtifactFormat, PostgresLedger};
        use crate::storage::S3ObjectStore;
        use crate::tools::{PgDumpTool, PgRestoreTool};

        settings.validate()?;
        let ledger = PostgresLedger::connect(settings.ledger.clone()).await?;
        let store = S3ObjectStore::new(&settings.storage).await?;
        store.ensure_bucket_exists().await?;

        let mut dump = PgDumpTool::new(settings.source.clone());
        if settings.backup.format == ArtifactFormat::PlainSql {
            dump = dump.plain_sql();
        }
        let restore_tool = PgRestoreTool::new(settings.restore.target.clone());

        info!(bucket = %settings.storage.bucket, database = %settings.source.database, "Backup service connected");
        Ok(Self::new(
            settings,
            Arc::new(ledger),
            Arc::new(store),
            Arc::new(dump),
            Arc::new(restore_tool),
        ))
    }

    /// Replace the alert sink on both orchestrators
    pub fn with_alerts(mut self, alerts: Arc<dyn crate::alerts::AlertSink>) -> Self {
        self.backups = self.backups.with_alerts(alerts.clone());
        self.restores = self.restores.with_alerts(alerts);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn gateway(&self) -> &Arc<ObjectStoreGateway> {
        &self.gateway
    }

    pub async fn full_backup(&self, label: Option<&str>, description: Option<&str>) -> OperationOutcome {
        self.backups.create_full_backup(label, description).await
    }

    pub async fn incremental_backup(&self, label: Option<&str>) -> OperationOutcome {
        self.backups.create_incremental_backup(label).await
    }

    pub async fn restore(&self, request: RestoreRequest) -> RestoreOutcome {
        self.restores.restore(request).await
    }

    pub async fn restore_status(&self, restore_id: &str) -> Result<Option<RestoreOperationRecord>> {
        self.restores.restore_status(restore_id).await
    }

    pub async fn list_restores(&self, limit: usize) -> Result<Vec<RestoreOperationRecord>> {
        self.restores.list_restores(limit).await
    }

    pub async fn prune(&self, dry_run: bool) -> Result<PruneReport> {
        self.retention.prune(dry_run).await
    }

    /// Recent backups, newest first
    pub async fn list_backups(
        &self,
        kind: Option<BackupKind>,
        status: Option<BackupStatus>,
        limit: usize,
    ) -> Result<Vec<BackupRecord>> {
        self.ledger.list_backups(kind, status, limit).await
    }

    pub async fn backup_details(&self, backup_id: &str) -> Result<Option<BackupDetails>> {
        let Some(record) = self.ledger.get_backup(backup_id).await? else {
            return Ok(None);
        };
        let segments = match record.kind {
            BackupKind::Incremental => self.ledger.get_wal_segments_for_backup(backup_id).await?,
            BackupKind::Full => Vec::new(),
        };
        Ok(Some(BackupDetails { record, segments }))
    }

    /// Ledger statistics; store usage is best effort
    pub async fn statistics(&self) -> Result<ServiceStatistics> {
        let ledger = self.ledger.statistics().await?;
        let storage = match self.gateway.bucket_usage().await {
            Ok(usage) => Some(usage),
            Err(e) => {
                warn!(error = %e, "Could not compute bucket usage");
                None
            }
        };
        Ok(ServiceStatistics { ledger, storage })
    }

    pub fn next_invocations(&self, now: DateTime<Utc>, count: usize) -> Result<Vec<Invocation>> {
        describe_next_invocations(&self.schedule, now, count)
    }

    /// Check the ledger, the object store and the dump tool's server
    pub async fn check_connectivity(&self) -> Vec<ConnectivityCheck> {
        let ledger = ConnectivityCheck::from_result("ledger", self.ledger.statistics().await, |stats| {
            format!("{} status groups", stats.summaries.len())
        });
        let storage = ConnectivityCheck::from_result("object_store", self.gateway.bucket_usage().await, |usage| {
            format!("{} objects in {}", usage.total_files, usage.bucket)
        });
        let source = ConnectivityCheck::from_result("source_database", self.backups.server_version().await, |v| v);
        vec![ledger, storage, source]
    }
}
