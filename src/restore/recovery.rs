// Recovery directives - tells the engine where to fetch WAL and when to stop replay

use crate::tools::WAL_STAGING_DIR;
use crate::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directive file written at the restore destination
pub const RECOVERY_CONF: &str = "recovery.conf";
/// Marker requesting standby mode
pub const STANDBY_SIGNAL: &str = "standby.signal";
/// Marker requesting targeted recovery
pub const RECOVERY_SIGNAL: &str = "recovery.signal";

/// Contents of the recovery configuration for one restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDirectives {
    /// Directory holding staged WAL segments
    pub wal_archive: PathBuf,
    pub target_time: Option<DateTime<Utc>>,
    pub standby: bool,
}

impl RecoveryDirectives {
    /// Directives reading WAL from `{destination}/wal_archive`
    pub fn new(destination: &Path, target_time: Option<DateTime<Utc>>, standby: bool) -> Self {
        Self {
            wal_archive: destination.join(WAL_STAGING_DIR),
            target_time,
            standby,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "restore_command = 'cp {}/%f %p'\n",
            self.wal_archive.display()
        );
        if let Some(target) = self.target_time {
            out.push_str(&format!(
                "recovery_target_time = '{}'\n",
                target.format("%Y-%m-%d %H:%M:%S%.6f+00:00")
            ));
            out.push_str("recovery_target_inclusive = true\n");
        }
        out.push_str(if self.standby {
            "standby_mode = on\n"
        } else {
            "standby_mode = off\n"
        });
        out
    }

    /// Marker file name matching the requested mode
    pub fn signal_file(&self) -> &'static str {
        if self.standby {
            STANDBY_SIGNAL
        } else {
            RECOVERY_SIGNAL
        }
    }

    /// Write the directive file and the mode marker into `destination`
    pub async fn write(&self, destination: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(destination).await?;
        let conf = destination.join(RECOVERY_CONF);
        tokio::fs::write(&conf, self.render()).await?;
        tokio::fs::write(destination.join(self.signal_file()), b"").await?;

        info!(path = %conf.display(), target_time = ?self.target_time, standby = self.standby, "Recovery directives written");
        Ok(conf)
    }
}
