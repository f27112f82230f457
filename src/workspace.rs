// Scoped work areas - one temporary directory per in-flight operation

use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Temporary directory exclusively owned by one backup or restore.
///
/// Removed by [`WorkArea::release`] or, on any early-return path, by `Drop`.
#[derive(Debug)]
pub struct WorkArea {
    dir: TempDir,
}

impl WorkArea {
    /// Create a fresh directory under `base` (system temp dir when `None`)
    pub fn create(base: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);

        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };

        debug!(path = %dir.path().display(), "Work area created");
        Ok(Self { dir })
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of `name` inside the work area
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the directory now, logging instead of failing
    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Work area removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove work area"),
        }
    }
}
