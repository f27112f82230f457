//! External tool integration: dump and restore-apply programs
//!
//! The orchestrators only see the [`DumpTool`] and [`RestoreTool`] traits; the
//! PostgreSQL client programs live in [`postgres`]. Timeouts are enforced by the
//! caller, and every spawned child is killed when its future is dropped.

pub mod postgres;

pub use postgres::{PgDumpTool, PgRestoreTool, RestoreTarget, SourceDatabase};

use crate::compression::{decompress_file, decompressed_path};
use crate::ledger::ArtifactFormat;
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Directory under a restore destination holding staged WAL segments
pub const WAL_STAGING_DIR: &str = "wal_archive";

/// Produces a full snapshot of the source database
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Artifact format this tool writes
    fn format(&self) -> ArtifactFormat;

    /// Write a snapshot to `output`
    async fn dump(&self, output: &Path) -> Result<()>;

    /// Engine version string of the source server
    async fn server_version(&self) -> Result<String>;
}

/// Applies base artifacts and WAL segments to a restore target
#[async_trait]
pub trait RestoreTool: Send + Sync {
    /// Load a decompressed base artifact into `destination` using the profile for `format`
    async fn apply_base(&self, artifact: &Path, format: ArtifactFormat, destination: &Path) -> Result<()>;

    /// Make one downloaded segment available to recovery under `destination`
    async fn apply_wal_segment(&self, segment: &Path, name: &str, destination: &Path) -> Result<()> {
        stage_wal_segment(segment, name, destination).await.map(|_| ())
    }
}

/// Captured output of a finished tool
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion; non-zero exit becomes `ToolInvocationFailed` carrying stderr
pub(crate) async fn run_command(tool: &str, mut cmd: Command) -> Result<ToolOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| BackupError::ToolInvocationFailed {
        tool: tool.to_string(),
        reason: format!("failed to spawn: {}", e),
    })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BackupError::ToolInvocationFailed {
            tool: tool.to_string(),
            reason: format!("failed to wait: {}", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(BackupError::ToolInvocationFailed {
            tool: tool.to_string(),
            reason: format!("exited with {}: {}", output.status, stderr.trim()),
        });
    }

    debug!(tool = %tool, "Tool finished");
    Ok(ToolOutput { stdout, stderr })
}

/// Copy (or gunzip) a segment into `{destination}/wal_archive/{name}`
pub async fn stage_wal_segment(segment: &Path, name: &str, destination: &Path) -> Result<PathBuf> {
    let staging = destination.join(WAL_STAGING_DIR);
    tokio::fs::create_dir_all(&staging).await?;

    let target_name = decompressed_path(Path::new(name))
        .unwrap_or_else(|| PathBuf::from(name));
    let target = staging.join(target_name);

    if decompressed_path(segment).is_some() {
        decompress_file(segment, &target).await?;
    } else {
        tokio::fs::copy(segment, &target).await?;
    }

    debug!(segment = %name, path = %target.display(), "WAL segment staged");
    Ok(target)
}
