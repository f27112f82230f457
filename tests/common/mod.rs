// Shared fixtures for the integration tests: in-process tools and a wired-up harness

#![allow(dead_code)]

use async_trait::async_trait;
use backupctl::backup::{BackupOptions, BackupOrchestrator};
use backupctl::ledger::{ArtifactFormat, MemoryLedger};
use backupctl::restore::{RestoreOptions, RestoreOrchestrator};
use backupctl::storage::{EncryptionMode, MemoryObjectStore, ObjectStoreGateway};
use backupctl::tools::{stage_wal_segment, DumpTool, RestoreTool};
use backupctl::{BackupError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Name of the file the fake restore tool writes the applied base into
pub const RESTORED_BASE: &str = "base.restored";

/// Dump tool writing fixed bytes, optionally slowly or not at all
pub struct FakeDump {
    pub payload: Vec<u8>,
    pub delay: Option<Duration>,
    pub fail: bool,
    /// The server version query never answers
    pub hanging_version: bool,
    /// A directory occupies `{output}.gz` so compression cannot write there
    pub block_compression: bool,
    /// Dumping switches this ledger to unavailable
    pub ledger_outage: Option<Arc<MemoryLedger>>,
    pub calls: Mutex<usize>,
}

impl FakeDump {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            delay: None,
            fail: false,
            hanging_version: false,
            block_compression: false,
            ledger_outage: None,
            calls: Mutex::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn hanging_version(mut self) -> Self {
        self.hanging_version = true;
        self
    }

    pub fn blocking_compression(mut self) -> Self {
        self.block_compression = true;
        self
    }

    /// Take `ledger` offline once the dump has been written
    pub fn with_ledger_outage(mut self, ledger: Arc<MemoryLedger>) -> Self {
        self.ledger_outage = Some(ledger);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl DumpTool for FakeDump {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::CustomArchive
    }

    async fn dump(&self, output: &Path) -> Result<()> {
        *self.calls.lock() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(BackupError::ToolInvocationFailed {
                tool: "pg_dump".to_string(),
                reason: "exited with exit status: 1: connection refused".to_string(),
            });
        }
        tokio::fs::write(output, &self.payload).await?;
        if self.block_compression {
            let mut blocked = output.as_os_str().to_owned();
            blocked.push(".gz");
            tokio::fs::create_dir_all(PathBuf::from(blocked)).await?;
        }
        if let Some(ledger) = &self.ledger_outage {
            ledger.set_unavailable(true);
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        if self.hanging_version {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok("PostgreSQL 16.2".to_string())
    }
}

/// Restore tool copying the base into the requested destination and staging WAL like the real one
#[derive(Default)]
pub struct FakeRestore {
    /// Segment names whose apply step fails
    pub failing_segments: Mutex<HashSet<String>>,
    pub applied_segments: Mutex<Vec<String>>,
    pub base_formats: Mutex<Vec<ArtifactFormat>>,
    /// Applying the base switches this ledger to unavailable
    pub ledger_outage: Option<Arc<MemoryLedger>>,
}

impl FakeRestore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `ledger` offline once the base has been applied
    pub fn with_ledger_outage(ledger: Arc<MemoryLedger>) -> Self {
        Self {
            ledger_outage: Some(ledger),
            ..Self::default()
        }
    }

    pub fn fail_segment(&self, name: &str) {
        self.failing_segments.lock().insert(name.to_string());
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied_segments.lock().clone()
    }
}

#[async_trait]
impl RestoreTool for FakeRestore {
    async fn apply_base(&self, artifact: &Path, format: ArtifactFormat, destination: &Path) -> Result<()> {
        self.base_formats.lock().push(format);
        tokio::fs::create_dir_all(destination).await?;
        tokio::fs::copy(artifact, destination.join(RESTORED_BASE)).await?;
        if let Some(ledger) = &self.ledger_outage {
            ledger.set_unavailable(true);
        }
        Ok(())
    }

    async fn apply_wal_segment(&self, segment: &Path, name: &str, destination: &Path) -> Result<()> {
        if self.failing_segments.lock().contains(name) {
            return Err(BackupError::ToolInvocationFailed {
                tool: "wal apply".to_string(),
                reason: format!("{} rejected", name),
            });
        }
        stage_wal_segment(segment, name, destination).await?;
        self.applied_segments.lock().push(name.to_string());
        Ok(())
    }
}

/// Everything a test needs, backed by in-memory stores and temp directories
pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub store: Arc<MemoryObjectStore>,
    pub gateway: Arc<ObjectStoreGateway>,
    pub root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::new("pitr-test"));
        let gateway = Arc::new(ObjectStoreGateway::new(
            store.clone(),
            "backups",
            EncryptionMode::ProviderManaged,
        ));
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            store,
            gateway,
            root: tempfile::tempdir().expect("temp root"),
        }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        let path = self.root.path().join(name);
        std::fs::create_dir_all(&path).expect("create fixture dir");
        path
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.dir("wal")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir("work")
    }

    pub fn destination(&self) -> PathBuf {
        self.root.path().join("restore")
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions::default()
            .with_work_dir(self.work_dir())
            .with_wal_directory(self.wal_dir())
            .with_dump_timeout(Duration::from_secs(5))
    }

    pub fn restore_options(&self) -> RestoreOptions {
        RestoreOptions {
            destination_root: self.destination(),
            work_dir: Some(self.work_dir()),
            base_timeout: Duration::from_secs(5),
            segment_timeout: Duration::from_secs(5),
            ..RestoreOptions::default()
        }
    }

    pub fn backups(&self, dump: Arc<dyn DumpTool>) -> BackupOrchestrator {
        BackupOrchestrator::new(self.ledger.clone(), self.gateway.clone(), dump, self.backup_options())
    }

    pub fn restores(&self, tool: Arc<dyn RestoreTool>) -> RestoreOrchestrator {
        RestoreOrchestrator::new(self.ledger.clone(), self.gateway.clone(), tool, self.restore_options())
    }

    /// Write a WAL segment file with the given modification time
    pub fn write_segment(&self, name: &str, body: &[u8], modified: SystemTime) -> PathBuf {
        let path = self.wal_dir().join(name);
        std::fs::write(&path, body).expect("write segment");
        let file = std::fs::File::options().write(true).open(&path).expect("open segment");
        file.set_modified(modified).expect("set mtime");
        path
    }

    /// Names of entries left in the work directory
    pub fn work_dir_entries(&self) -> Vec<String> {
        std::fs::read_dir(self.work_dir())
            .expect("read work dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }
}

/// `n`-th segment name on timeline 1
pub fn segment_name(n: u64) -> String {
    format!("00000001{:016X}", n)
}
