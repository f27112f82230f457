use super::records::*;
use super::{dedupe_chain, Ledger};
use crate::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct LedgerState {
    backups: HashMap<String, BackupRecord>,
    segments: Vec<WalSegmentRecord>,
    next_segment_id: i64,
    restores: HashMap<String, RestoreOperationRecord>,
    leases: HashMap<String, (String, Instant)>,
}

/// Process-local ledger.
///
/// Every mutation happens under one lock, so each write is atomic. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `LedgerUnavailable` (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackupError::LedgerUnavailable(
                "memory ledger marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn initialize_schema(&self) -> Result<()> {
        self.check_available()
    }

    async fn create_backup(&self, draft: BackupDraft) -> Result<String> {
        self.check_available()?;
        let mut state = self.state.lock();

        if state.backups.contains_key(&draft.id) {
            return Err(BackupError::LedgerUnavailable(format!(
                "duplicate backup id {}",
                draft.id
            )));
        }

        let id = draft.id.clone();
        state.backups.insert(id.clone(), draft.into_record());
        Ok(id)
    }

    async fn update_backup_status(
        &self,
        id: &str,
        status: BackupStatus,
        end_time: Option<DateTime<Utc>>,
        fields: BackupUpdate,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let record = state
            .backups
            .get_mut(id)
            .ok_or_else(|| BackupError::RecordNotFound(id.to_string()))?;

        validate_backup_transition(record, status, &fields)?;

        // Apply to a copy so a partially-applied update is never observable
        let mut updated = record.clone();
        updated.status = status;
        if end_time.is_some() {
            updated.end_time = end_time;
        }
        fields.apply_to(&mut updated);
        *record = updated;
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        self.check_available()?;
        Ok(self.state.lock().backups.get(id).cloned())
    }

    async fn list_backups(
        &self,
        kind: Option<BackupKind>,
        status: Option<BackupStatus>,
        limit: usize,
    ) -> Result<Vec<BackupRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut records: Vec<BackupRecord> = state
            .backups
            .values()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();

        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    async fn get_latest_completed(&self, kind: BackupKind) -> Result<Option<BackupRecord>> {
        Ok(self
            .list_backups(Some(kind), Some(BackupStatus::Completed), 1)
            .await?
            .into_iter()
            .next())
    }

    async fn create_wal_segment(&self, draft: WalSegmentDraft) -> Result<i64> {
        self.check_available()?;
        let mut state = self.state.lock();

        if !state.backups.contains_key(&draft.backup_id) {
            return Err(BackupError::RecordNotFound(draft.backup_id));
        }

        state.next_segment_id += 1;
        let id = state.next_segment_id;
        state.segments.push(WalSegmentRecord {
            id,
            segment_name: draft.segment_name,
            backup_id: draft.backup_id,
            start_time: draft.start_time,
            end_time: draft.end_time,
            size_bytes: draft.size_bytes,
            remote_key: draft.remote_key,
            checksum: draft.checksum,
            sequence: draft.sequence,
        });
        Ok(id)
    }

    async fn get_wal_segments_for_backup(&self, backup_id: &str) -> Result<Vec<WalSegmentRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut segments: Vec<WalSegmentRecord> = state
            .segments
            .iter()
            .filter(|s| s.backup_id == backup_id)
            .cloned()
            .collect();
        segments.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.id.cmp(&b.id)));
        Ok(segments)
    }

    async fn get_wal_chain(&self, base_backup_id: &str) -> Result<Vec<WalSegmentRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        let segments: Vec<WalSegmentRecord> = state
            .segments
            .iter()
            .filter(|s| {
                state.backups.get(&s.backup_id).map_or(false, |batch| {
                    batch.kind == BackupKind::Incremental
                        && batch.status == BackupStatus::Completed
                        && batch.parent_backup_id.as_deref() == Some(base_backup_id)
                })
            })
            .cloned()
            .collect();
        Ok(dedupe_chain(segments))
    }

    async fn create_restore_operation(&self, draft: RestoreDraft) -> Result<String> {
        self.check_available()?;
        let mut state = self.state.lock();

        if !state.backups.contains_key(&draft.backup_id) {
            return Err(BackupError::RecordNotFound(draft.backup_id));
        }

        let id = draft.id.clone();
        state.restores.insert(id.clone(), draft.into_record());
        Ok(id)
    }

    async fn update_restore_status(
        &self,
        id: &str,
        status: RestoreStatus,
        end_time: Option<DateTime<Utc>>,
        error_detail: Option<String>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let record = state
            .restores
            .get_mut(id)
            .ok_or_else(|| BackupError::RecordNotFound(id.to_string()))?;

        if !record.status.can_transition_to(status) {
            return Err(BackupError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }

        record.status = status;
        if end_time.is_some() {
            record.end_time = end_time;
        }
        if error_detail.is_some() {
            record.error_detail = error_detail;
        }
        Ok(())
    }

    async fn get_restore_operation(&self, id: &str) -> Result<Option<RestoreOperationRecord>> {
        self.check_available()?;
        Ok(self.state.lock().restores.get(id).cloned())
    }

    async fn list_restore_operations(&self, limit: usize) -> Result<Vec<RestoreOperationRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut records: Vec<RestoreOperationRecord> = state.restores.values().cloned().collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records.truncate(limit);
        Ok(records)
    }

    async fn mark_purged(&self, id: &str) -> Result<()> {
        self.update_backup_status(id, BackupStatus::Purged, None, BackupUpdate::default())
            .await
    }

    async fn statistics(&self) -> Result<LedgerStatistics> {
        self.check_available()?;
        let state = self.state.lock();
        let mut grouped: HashMap<(BackupKind, BackupStatus), (u64, u64)> = HashMap::new();
        let mut stats = LedgerStatistics::default();

        for record in state.backups.values() {
            let entry = grouped.entry((record.kind, record.status)).or_default();
            entry.0 += 1;
            entry.1 += record.size_bytes.unwrap_or(0);

            if record.status == BackupStatus::Completed {
                let slot = match record.kind {
                    BackupKind::Full => &mut stats.last_full,
                    BackupKind::Incremental => &mut stats.last_incremental,
                };
                if slot.map_or(true, |t| record.start_time > t) {
                    *slot = Some(record.start_time);
                }
            }
        }

        stats.summaries = grouped
            .into_iter()
            .map(|((kind, status), (count, total_bytes))| StatusSummary {
                kind,
                status,
                count,
                total_bytes,
            })
            .collect();
        stats
            .summaries
            .sort_by(|a, b| (a.kind.as_str(), a.status.as_str()).cmp(&(b.kind.as_str(), b.status.as_str())));
        Ok(stats)
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Instant::now();

        if let Some((current, expires)) = state.leases.get(name) {
            if current != holder && *expires > now {
                return Ok(false);
            }
        }

        state
            .leases
            .insert(name.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.leases.get(name).map_or(false, |(h, _)| h == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }
}
