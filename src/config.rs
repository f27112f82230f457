// Configuration - YAML settings with environment expansion and validation

use crate::backup::BackupOptions;
use crate::ledger::{ArtifactFormat, LedgerConfig};
use crate::restore::RestoreOptions;
use crate::retention::RetentionPolicy;
use crate::schedule::ScheduleConfig;
use crate::storage::EncryptionMode;
use crate::telemetry::LoggingConfig;
use crate::tools::{RestoreTarget, SourceDatabase};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "BACKUPCTL_CONFIG";

/// Object store section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Key prefix under which every artifact is stored
    pub prefix: String,
    pub encryption: EncryptionMode,
    /// Required for `sse-kms`
    pub kms_key_id: Option<String>,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            prefix: "backups".to_string(),
            encryption: EncryptionMode::ProviderManaged,
            kms_key_id: None,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// Backup section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub compression_enabled: bool,
    pub compression_level: u32,
    /// `custom_archive` or `plain_sql`
    pub format: ArtifactFormat,
    pub dump_timeout_secs: u64,
    pub work_dir: Option<PathBuf>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        let options = BackupOptions::default();
        Self {
            compression_enabled: options.compression_enabled,
            compression_level: options.compression_level,
            format: ArtifactFormat::CustomArchive,
            dump_timeout_secs: options.dump_timeout.as_secs(),
            work_dir: None,
        }
    }
}

impl BackupSettings {
    pub fn to_options(&self, source: &SourceDatabase) -> BackupOptions {
        let dump_timeout = Duration::from_secs(self.dump_timeout_secs);
        let mut options = BackupOptions::default()
            .with_compression(self.compression_enabled)
            .with_compression_level(self.compression_level)
            .with_dump_timeout(dump_timeout)
            .with_wal_directory(source.wal_directory.clone())
            .with_database(source.database.clone());
        options.work_dir = self.work_dir.clone();
        options.lease_ttl = dump_timeout + Duration::from_secs(600);
        options
    }
}

/// Restore section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSettings {
    pub destination: PathBuf,
    pub base_timeout_secs: u64,
    pub segment_timeout_secs: u64,
    pub work_dir: Option<PathBuf>,
    pub standby: bool,
    /// Server base artifacts are applied to
    pub target: RestoreTarget,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        let options = RestoreOptions::default();
        Self {
            destination: options.destination_root,
            base_timeout_secs: options.base_timeout.as_secs(),
            segment_timeout_secs: options.segment_timeout.as_secs(),
            work_dir: None,
            standby: false,
            target: RestoreTarget::default(),
        }
    }
}

impl RestoreSettings {
    pub fn to_options(&self, source: &SourceDatabase) -> RestoreOptions {
        let base_timeout = Duration::from_secs(self.base_timeout_secs);
        RestoreOptions {
            destination_root: self.destination.clone(),
            base_timeout,
            segment_timeout: Duration::from_secs(self.segment_timeout_secs),
            work_dir: self.work_dir.clone(),
            database: source.database.clone(),
            lease_ttl: base_timeout * 2,
            standby: self.standby,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: SourceDatabase,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
    pub backup: BackupSettings,
    pub restore: RestoreSettings,
    pub retention: RetentionPolicy,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Parse YAML after expanding `${VAR}` and `${VAR:default}` references
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let expanded = expand_env(text, |name| std::env::var(name).ok())?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loading configuration");
        Self::from_yaml_str(&text)
    }

    /// Load from [`discover_config_path`] and validate
    pub fn discover() -> Result<Self> {
        let path = discover_config_path()
            .ok_or_else(|| BackupError::Config("no configuration file found".to_string()))?;
        let settings = Self::load(&path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings no operation could run with
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("source.host", &self.source.host),
            ("source.user", &self.source.user),
            ("source.database", &self.source.database),
            ("storage.bucket", &self.storage.bucket),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(BackupError::Config(format!("missing required setting {}", key)));
            }
        }

        if self.backup.compression_level > crate::compression::MAX_LEVEL {
            return Err(BackupError::Config(format!(
                "backup.compression_level must be 0-{}, got {}",
                crate::compression::MAX_LEVEL,
                self.backup.compression_level
            )));
        }
        if self.backup.format == ArtifactFormat::WalArchive {
            return Err(BackupError::Config(
                "backup.format must be custom_archive or plain_sql".to_string(),
            ));
        }
        if self.storage.encryption == EncryptionMode::CustomerKey && self.storage.kms_key_id.is_none() {
            return Err(BackupError::Config(
                "storage.kms_key_id is required for sse-kms encryption".to_string(),
            ));
        }
        if self.retention.full_days < 0 || self.retention.incremental_days < 0 {
            return Err(BackupError::Config("retention days cannot be negative".to_string()));
        }
        for (name, secs) in [
            ("backup.dump_timeout_secs", self.backup.dump_timeout_secs),
            ("restore.base_timeout_secs", self.restore.base_timeout_secs),
            ("restore.segment_timeout_secs", self.restore.segment_timeout_secs),
        ] {
            if secs == 0 {
                return Err(BackupError::Config(format!("{} must be positive", name)));
            }
        }

        self.schedule.parsed()?;
        Ok(())
    }
}

/// First existing configuration file among the usual locations
pub fn discover_config_path() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        candidates.push(PathBuf::from(explicit));
    }
    candidates.push(PathBuf::from("./config/config.yaml"));
    candidates.push(PathBuf::from("/etc/backupctl/config.yaml"));
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(Path::new(&home).join(".backupctl/config.yaml"));
    }
    candidates.push(PathBuf::from("./config.yaml"));

    candidates.into_iter().find(|p| p.is_file())
}

/// Substitute `${NAME}` and `${NAME:default}` using `lookup`.
///
/// An unset variable without a default is an error.
pub fn expand_env(text: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| BackupError::Config(format!("unterminated '${{' in '{}'", &rest[start..])))?;
        let reference = &after[..end];

        let (name, default) = match reference.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        match (lookup(name), default) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(default)) => out.push_str(default),
            (None, None) => {
                return Err(BackupError::Config(format!(
                    "environment variable {} is not set",
                    name
                )))
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
