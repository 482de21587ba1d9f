use std::collections::HashSet;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use equiptrack_core::{TransferId, UnitId};
use equiptrack_inventory::TransferRecord;

use super::StoreError;

/// Append-only Transfer Ledger (`TransferLog`).
///
/// Records are never updated or deleted through this port.
pub trait TransferLedger: Send + Sync {
    fn append(&self, record: TransferRecord) -> Result<(), StoreError>;

    /// Every record for one unit, in append order.
    fn history_for_unit(&self, unit_id: UnitId) -> Result<Vec<TransferRecord>, StoreError>;

    fn latest_for_unit(&self, unit_id: UnitId) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.history_for_unit(unit_id)?.pop())
    }

    /// Records appended with exactly this reason, in append order.
    fn recorded_with_reason(&self, reason: &str) -> Result<Vec<TransferRecord>, StoreError>;

    /// Oldest archivable records before `cutoff`; `retain_forever` entries are excluded.
    fn recorded_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<TransferRecord>,
    ids: HashSet<TransferId>,
}

#[derive(Debug, Default)]
pub struct InMemoryTransferLedger {
    log: RwLock<Log>,
}

impl InMemoryTransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the whole log, in append order.
    pub fn all(&self) -> Vec<TransferRecord> {
        self.log
            .read()
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }
}

impl TransferLedger for InMemoryTransferLedger {
    fn append(&self, record: TransferRecord) -> Result<(), StoreError> {
        let mut log = self.log.write().map_err(|_| StoreError::poisoned())?;
        if !log.ids.insert(record.id) {
            return Err(StoreError::Duplicate(format!(
                "transfer record {} already appended",
                record.id
            )));
        }
        log.records.push(record);
        Ok(())
    }

    fn history_for_unit(&self, unit_id: UnitId) -> Result<Vec<TransferRecord>, StoreError> {
        let log = self.log.read().map_err(|_| StoreError::poisoned())?;
        Ok(log
            .records
            .iter()
            .filter(|r| r.unit_id == unit_id)
            .cloned()
            .collect())
    }

    fn recorded_with_reason(&self, reason: &str) -> Result<Vec<TransferRecord>, StoreError> {
        let log = self.log.read().map_err(|_| StoreError::poisoned())?;
        Ok(log
            .records
            .iter()
            .filter(|r| r.reason == reason)
            .cloned()
            .collect())
    }

    fn recorded_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let log = self.log.read().map_err(|_| StoreError::poisoned())?;
        let mut hits: Vec<TransferRecord> = log
            .records
            .iter()
            .filter(|r| !r.retain_forever && r.occurred_at < cutoff)
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.occurred_at);
        hits.truncate(limit);
        Ok(hits)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let log = self.log.read().map_err(|_| StoreError::poisoned())?;
        Ok(log.records.len() as u64)
    }
}
