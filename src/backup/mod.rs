// Backup pipelines - full snapshots and incremental WAL batches

mod orchestrator;
pub mod types;
pub mod wal;

pub use orchestrator::BackupOrchestrator;
pub use types::{BackupOptions, BatchManifest, ManifestEntry, OperationOutcome, DEFAULT_DUMP_TIMEOUT};
pub use wal::{discover_wal_segments, DiscoveredSegment};
