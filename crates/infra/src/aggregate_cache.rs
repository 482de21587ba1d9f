//! Aggregate Cache: the `InventoryMaster` rows, always re-derived from units.
//!
//! Counters are never adjusted incrementally. Every write path ends with
//! [`AggregateCache::recompute`], which rescans the key's units and replaces
//! (or deletes) the stored row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use equiptrack_inventory::{
    AggregateCounts, InventoryMaster, ItemKey, LedgerEvent, ReadinessRule, derive_counts,
};

use crate::error::LedgerError;
use crate::notify::Notifier;
use crate::store::{AggregateStore, StoreError, UnitStore};

/// State of one aggregate row after a recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AggregateSnapshot {
    Present(InventoryMaster),
    /// No non-deleted units remain; the row does not exist.
    Removed { key: ItemKey },
}

impl AggregateSnapshot {
    pub fn key(&self) -> &ItemKey {
        match self {
            AggregateSnapshot::Present(master) => &master.key,
            AggregateSnapshot::Removed { key } => key,
        }
    }

    /// Zero counts for a removed row.
    pub fn counts(&self) -> AggregateCounts {
        match self {
            AggregateSnapshot::Present(master) => master.counts,
            AggregateSnapshot::Removed { .. } => AggregateCounts::default(),
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, AggregateSnapshot::Removed { .. })
    }
}

/// Stored row next to a fresh derivation, as compared by verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReading {
    pub key: ItemKey,
    pub stored: Option<AggregateCounts>,
    /// `None` when the key has no non-deleted units.
    pub recomputed: Option<AggregateCounts>,
}

impl AggregateReading {
    pub fn drifted(&self) -> bool {
        self.stored != self.recomputed
    }

    fn drift_error(&self) -> LedgerError {
        LedgerError::DriftDetected {
            key: self.key.clone(),
            stored: self.stored,
            recomputed: self.recomputed,
        }
    }
}

pub struct AggregateCache {
    units: Arc<dyn UnitStore>,
    masters: Arc<dyn AggregateStore>,
    rule: ReadinessRule,
    notifier: Notifier,
    // Serializes scan+write per key so a slower recompute cannot overwrite a newer one.
    key_locks: Mutex<HashMap<ItemKey, Arc<Mutex<()>>>>,
}

impl AggregateCache {
    pub fn new(
        units: Arc<dyn UnitStore>,
        masters: Arc<dyn AggregateStore>,
        rule: ReadinessRule,
        notifier: Notifier,
    ) -> Self {
        Self {
            units,
            masters,
            rule,
            notifier,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn rule(&self) -> &ReadinessRule {
        &self.rule
    }

    /// Stored row as dashboards read it.
    pub fn get(&self, key: &ItemKey) -> Result<Option<InventoryMaster>, LedgerError> {
        Ok(self.masters.get(key)?)
    }

    pub fn list(&self) -> Result<Vec<InventoryMaster>, LedgerError> {
        Ok(self.masters.list()?)
    }

    /// Re-derive the row for `key` from a full unit scan and persist it.
    ///
    /// Zero non-deleted units deletes the row instead of storing zeros.
    pub fn recompute(&self, key: &ItemKey) -> Result<AggregateSnapshot, LedgerError> {
        let lock = self.key_lock(key)?;
        let snapshot = {
            let _held = lock.lock().map_err(|_| StoreError::poisoned())?;
            self.recompute_locked(key)?
        };
        if snapshot.is_removed() {
            self.release_key_lock(key, &lock)?;
        }
        Ok(snapshot)
    }

    fn recompute_locked(&self, key: &ItemKey) -> Result<AggregateSnapshot, LedgerError> {
        let units = self.units.list_by_key(key)?;
        let counts = derive_counts(key, &units, &self.rule);

        if counts.is_empty() {
            if self.masters.delete(key)? {
                debug!(item_type = key.item_type(), category_id = %key.category_id(), "aggregate row removed");
            }
            return Ok(AggregateSnapshot::Removed { key: key.clone() });
        }

        if let Some(stored) = self.masters.get(key)? {
            if stored.counts == counts {
                return Ok(AggregateSnapshot::Present(stored));
            }
        }
        let master = InventoryMaster::new(key.clone(), counts, Utc::now());
        self.masters.upsert(master.clone())?;
        debug!(
            item_type = key.item_type(),
            category_id = %key.category_id(),
            total = counts.total_quantity,
            available = counts.available_quantity,
            user_owned = counts.user_owned_quantity,
            "aggregate recomputed"
        );
        Ok(AggregateSnapshot::Present(master))
    }

    /// Compare the stored row with a fresh derivation without writing.
    pub fn read(&self, key: &ItemKey) -> Result<AggregateReading, LedgerError> {
        let units = self.units.list_by_key(key)?;
        let counts = derive_counts(key, &units, &self.rule);
        Ok(AggregateReading {
            key: key.clone(),
            stored: self.masters.get(key)?.map(|m| m.counts),
            recomputed: (!counts.is_empty()).then_some(counts),
        })
    }

    /// `DriftDetected` if the stored row disagrees with its units.
    pub fn verify(&self, key: &ItemKey) -> Result<AggregateReading, LedgerError> {
        let reading = self.read(key)?;
        if reading.drifted() {
            return Err(reading.drift_error());
        }
        Ok(reading)
    }

    /// Recompute `key` if it drifted, logging and announcing the correction.
    ///
    /// Returns the corrected snapshot, or `None` when the row was accurate.
    pub fn correct(&self, key: &ItemKey) -> Result<Option<AggregateSnapshot>, LedgerError> {
        let lock = self.key_lock(key)?;
        let held = lock.lock().map_err(|_| StoreError::poisoned())?;

        let reading = self.read(key)?;
        if !reading.drifted() {
            drop(held);
            if reading.stored.is_none() {
                self.release_key_lock(key, &lock)?;
            }
            return Ok(None);
        }
        warn!(
            item_type = key.item_type(),
            category_id = %key.category_id(),
            error = %reading.drift_error(),
            "aggregate drift detected; recomputing"
        );
        let snapshot = self.recompute_locked(key)?;
        drop(held);
        if snapshot.is_removed() {
            self.release_key_lock(key, &lock)?;
        }
        self.notifier.publish(LedgerEvent::DriftCorrected {
            key: key.clone(),
            stored: reading.stored,
            recomputed: reading.recomputed,
            occurred_at: Utc::now(),
        });
        Ok(Some(snapshot))
    }

    fn key_lock(&self, key: &ItemKey) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self.key_locks.lock().map_err(|_| StoreError::poisoned())?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }

    /// Forget the lock of a key whose row is gone, unless another caller
    /// still holds a handle to it (map entry + `lock` = 2).
    fn release_key_lock(&self, key: &ItemKey, lock: &Arc<Mutex<()>>) -> Result<(), StoreError> {
        let mut locks = self.key_locks.lock().map_err(|_| StoreError::poisoned())?;
        let idle = locks
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(key);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
