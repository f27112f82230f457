//! # backupctl
//!
//! Point-in-time-recoverable backups for PostgreSQL: full snapshots, incremental
//! WAL segment archives, integrity-verified transfer to an object store, a
//! metadata ledger recording provenance, and reconstruction to an arbitrary
//! past instant.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use backupctl::backup::{BackupOptions, BackupOrchestrator};
//! use backupctl::ledger::MemoryLedger;
//! use backupctl::storage::{EncryptionMode, MemoryObjectStore, ObjectStoreGateway};
//! use backupctl::tools::{PgDumpTool, SourceDatabase};
//!
//! # async fn example() -> backupctl::Result<()> {
//! let ledger = Arc::new(MemoryLedger::new());
//! let gateway = Arc::new(ObjectStoreGateway::new(
//!     Arc::new(MemoryObjectStore::new("backups")),
//!     "backups",
//!     EncryptionMode::ProviderManaged,
//! ));
//! let dump = Arc::new(PgDumpTool::new(SourceDatabase::default()));
//!
//! let orchestrator = BackupOrchestrator::new(ledger, gateway, dump, BackupOptions::default());
//! let outcome = orchestrator.create_full_backup(Some("nightly"), None).await;
//! println!("success={} detail={}", outcome.success, outcome.detail);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`ledger`]: metadata ledger (records, status machine, leases)
//! - [`storage`]: object store transport and the verifying gateway
//! - [`backup`]: full and incremental backup pipelines
//! - [`restore`]: point-in-time restore orchestration
//! - [`retention`]: age-based pruning
//! - [`schedule`]: next-invocation computation for the periodic trigger
//! - [`service`]: facade wiring every component from [`config::Settings`]

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for backup, restore and retention operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// External dump/restore tool exited non-zero, timed out, or produced no output
    #[error("Tool invocation failed ({tool}): {reason}")]
    ToolInvocationFailed {
        /// Program or tool profile that failed
        tool: String,
        /// Diagnostic (stderr, timeout, missing output)
        reason: String,
    },

    /// Network, permission or quota failure talking to the object store
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Checksum disagreement between local and remote bytes
    #[error("Integrity mismatch for {key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Remote key or local path being verified
        key: String,
        /// Checksum that was expected
        expected: String,
        /// Checksum that was computed
        actual: String,
    },

    /// Download of a key that does not exist
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Metadata store unreachable or write rejected
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Restore resolution found no usable base backup
    #[error("No backup available: {0}")]
    NoBackupAvailable(String),

    /// Lookup by identifier missed
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Another backup or restore holds the lease for this database
    #[error("Operation already in progress: {0}")]
    AlreadyInProgress(String),

    /// Status change not permitted by the record lifecycle
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Record identifier
        id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid schedule expression
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        BackupError::LedgerUnavailable(err.to_string())
    }
}

impl From<serde_yaml::Error> for BackupError {
    fn from(err: serde_yaml::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

/// Metadata ledger: records, lifecycle rules and backing stores
pub mod ledger;

/// Object store transport and integrity-verified gateway
pub mod storage;

/// Full and incremental backup pipelines
pub mod backup;

/// Point-in-time restore orchestration
pub mod restore;

/// Age-based retention and pruning
pub mod retention;

/// Content checksums
pub mod integrity;

/// Gzip file compression
pub mod compression;

/// Scoped temporary work areas
pub mod workspace;

/// External dump and restore-apply tools
pub mod tools;

/// Structured alert events
pub mod alerts;

/// Cron-style schedule evaluation
pub mod schedule;

/// Configuration loading and validation
pub mod config;

/// Logging initialisation
pub mod telemetry;

/// Facade wiring all components from configuration
pub mod service;
