// Backup pipeline types - options, outcomes and the incremental batch manifest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default hard limit on a dump tool invocation
pub const DEFAULT_DUMP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Tunables for the backup pipelines
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub compression_enabled: bool,
    /// gzip level, 0-9
    pub compression_level: u32,
    pub dump_timeout: Duration,
    /// Parent directory for work areas; system temp dir when `None`
    pub work_dir: Option<PathBuf>,
    /// Directory the server archives completed WAL segments into
    pub wal_directory: PathBuf,
    /// Source database name; scopes the backup lease
    pub database: String,
    pub lease_ttl: Duration,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_level: 6,
            dump_timeout: DEFAULT_DUMP_TIMEOUT,
            work_dir: None,
            wal_directory: PathBuf::from("/var/lib/postgresql/wal_archive"),
            database: "postgres".to_string(),
            lease_ttl: DEFAULT_DUMP_TIMEOUT + Duration::from_secs(600),
        }
    }
}

impl BackupOptions {
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(crate::compression::MAX_LEVEL);
        self
    }

    pub fn with_dump_timeout(mut self, timeout: Duration) -> Self {
        self.dump_timeout = timeout;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_wal_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal_directory = dir.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

/// What a backup invocation reports back to its caller.
///
/// `detail` is the new backup identifier on success and the failure reason otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub detail: String,
    /// Set whenever a ledger record was created, even for failures
    pub backup_id: Option<String>,
}

impl OperationOutcome {
    pub fn succeeded(backup_id: impl Into<String>) -> Self {
        let id = backup_id.into();
        Self {
            success: true,
            detail: id.clone(),
            backup_id: Some(id),
        }
    }

    pub fn failed(detail: impl Into<String>, backup_id: Option<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            backup_id,
        }
    }
}

/// One archived segment as listed in a batch manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub segment_name: String,
    pub remote_key: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// JSON document uploaded alongside each incremental batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub backup_id: String,
    pub parent_backup_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub segments: Vec<ManifestEntry>,
    /// Segments discovered but not archived in this batch
    #[serde(default)]
    pub failed_segments: Vec<String>,
}

impl BatchManifest {
    /// Sum of archived segment sizes
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.segment_name.clone()).collect()
    }
}
