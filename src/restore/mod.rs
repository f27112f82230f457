//! Point-in-time restore: base backup plus an ordered WAL chain up to a target instant

mod orchestrator;
pub mod recovery;

pub use orchestrator::RestoreOrchestrator;
pub use recovery::RecoveryDirectives;

use crate::ledger::RestoreStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default hard limit on applying a base artifact
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default hard limit on applying one WAL segment
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Tunables for restores
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Destination used when a request names none
    pub destination_root: PathBuf,
    pub base_timeout: Duration,
    pub segment_timeout: Duration,
    /// Parent directory for work areas; system temp dir when `None`
    pub work_dir: Option<PathBuf>,
    /// Source database name; scopes the restore lease
    pub database: String,
    pub lease_ttl: Duration,
    /// Write standby directives instead of one-shot recovery
    pub standby: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            destination_root: PathBuf::from("/var/lib/postgresql/restore"),
            base_timeout: DEFAULT_BASE_TIMEOUT,
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            work_dir: None,
            database: "postgres".to_string(),
            lease_ttl: DEFAULT_BASE_TIMEOUT * 2,
            standby: false,
        }
    }
}

/// What to restore, to when, and where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Base backup; latest completed full backup when `None`
    pub backup_id: Option<String>,
    /// Replay WAL up to and including this instant
    pub target_time: Option<DateTime<Utc>>,
    pub destination: Option<PathBuf>,
}

impl RestoreRequest {
    /// Latest base, no WAL replay, default destination
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn with_backup_id(mut self, id: impl Into<String>) -> Self {
        self.backup_id = Some(id.into());
        self
    }

    pub fn with_target_time(mut self, target: DateTime<Utc>) -> Self {
        self.target_time = Some(target);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Result of a restore invocation.
///
/// `success` is true for both `completed` and `partial`; `skipped` lists WAL
/// segments that could not be downloaded, verified or applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub success: bool,
    /// Restore identifier on success, failure reason otherwise
    pub detail: String,
    pub restore_id: Option<String>,
    pub backup_id: Option<String>,
    pub status: Option<RestoreStatus>,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl RestoreOutcome {
    pub(crate) fn failed(detail: impl Into<String>, restore_id: Option<String>, backup_id: Option<String>) -> Self {
        // No status until a restore record exists
        let status = restore_id.as_ref().map(|_| RestoreStatus::Failed);
        Self {
            success: false,
            detail: detail.into(),
            restore_id,
            backup_id,
            status,
            applied: Vec::new(),
            skipped: Vec::new(),
        }
    }
}
