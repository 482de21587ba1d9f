//! Reconciliation Job: drift detection, aggregate repair and purge.
//!
//! `reconcile` only reads. `purge` is the single actor allowed to move a unit
//! from `soft_deleted` to `purged`: it appends a retain-forever removal record,
//! deletes the row, then recomputes every aggregate in scope.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use equiptrack_core::{AggregateRoot, ExpectedVersion, TransferId, UnitId};
use equiptrack_inventory::{
    AggregateCounts, ItemKey, LedgerEvent, TransferRecord, TransferType, derive_counts,
};

use crate::aggregate_cache::{AggregateCache, AggregateSnapshot};
use crate::error::LedgerError;
use crate::locks::WorkflowLocks;
use crate::notify::Notifier;
use crate::store::{StoreError, TransferLedger, UnitStore};

const PURGE_LOCK: &str = "maintenance:purge";
const PURGE_REASON: &str = "reconciliation purge";

/// Blast radius of a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Scope {
    All,
    Key { key: ItemKey },
}

impl Scope {
    pub fn key(key: ItemKey) -> Self {
        Scope::Key { key }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::All => f.write_str("all item types"),
            Scope::Key { key } => write!(f, "{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Full analysis, no writes.
    DryRun,
    Apply,
}

/// Diagnostics for one item key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub key: ItemKey,
    pub stored: Option<AggregateCounts>,
    /// `None` when no non-deleted units remain.
    pub recomputed: Option<AggregateCounts>,
    /// Rows physically present, soft-deleted ones included.
    pub naive_row_count: u64,
    pub soft_deleted: Vec<UnitId>,
    /// Soft-deleted admin-stock units `purge` would remove.
    pub purge_eligible: Vec<UnitId>,
    /// Soft-deleted units still held by a user; never purged.
    pub blocked: Vec<UnitId>,
}

impl KeyReport {
    pub fn drifted(&self) -> bool {
        self.stored != self.recomputed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub scope: Scope,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<KeyReport>,
}

impl ReconciliationReport {
    pub fn drift_count(&self) -> usize {
        self.entries.iter().filter(|e| e.drifted()).count()
    }

    pub fn purge_eligible_count(&self) -> usize {
        self.entries.iter().map(|e| e.purge_eligible.len()).sum()
    }

    pub fn entry(&self, key: &ItemKey) -> Option<&KeyReport> {
        self.entries.iter().find(|e| &e.key == key)
    }

    /// One `DriftDetected` per drifted key.
    pub fn drift_errors(&self) -> Vec<LedgerError> {
        self.entries
            .iter()
            .filter(|e| e.drifted())
            .map(|e| LedgerError::DriftDetected {
                key: e.key.clone(),
                stored: e.stored,
                recomputed: e.recomputed,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgedEntry {
    pub unit_id: UnitId,
    pub key: ItemKey,
    /// Removal record; `None` in a dry run.
    pub transfer_id: Option<TransferId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUnit {
    pub unit_id: UnitId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub mode: RunMode,
    pub scope: Scope,
    pub generated_at: DateTime<Utc>,
    pub purged: Vec<PurgedEntry>,
    pub skipped: Vec<SkippedUnit>,
    /// Keys whose stored row disagreed with its units before the run.
    pub drifted: Vec<ItemKey>,
    /// Rows after recomputation; empty in a dry run.
    pub aggregates: Vec<AggregateSnapshot>,
}

/// Who blocks the deletion of an item key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionEligibility {
    pub key: ItemKey,
    /// Active admin-stock units a deletion would soft-delete.
    pub admin_units: Vec<UnitId>,
    pub user_owned: Vec<UnitId>,
}

impl DeletionEligibility {
    pub fn ensure_deletable(&self) -> Result<(), LedgerError> {
        if self.user_owned.is_empty() {
            return Ok(());
        }
        Err(LedgerError::DeletionBlocked {
            subject: self.key.to_string(),
            count: self.user_owned.len(),
            unit_ids: self.user_owned.clone(),
        })
    }
}

pub struct ReconciliationJob {
    units: Arc<dyn UnitStore>,
    ledger: Arc<dyn TransferLedger>,
    cache: Arc<AggregateCache>,
    locks: WorkflowLocks,
    notifier: Notifier,
}

impl ReconciliationJob {
    pub fn new(
        units: Arc<dyn UnitStore>,
        ledger: Arc<dyn TransferLedger>,
        cache: Arc<AggregateCache>,
        locks: WorkflowLocks,
        notifier: Notifier,
    ) -> Self {
        Self {
            units,
            ledger,
            cache,
            locks,
            notifier,
        }
    }

    /// Read-only diagnostic report.
    #[instrument(skip(self), fields(scope = %scope))]
    pub fn reconcile(&self, scope: &Scope) -> Result<ReconciliationReport, LedgerError> {
        let mut entries = Vec::new();
        for key in self.keys_in(scope)? {
            entries.push(self.inspect(&key)?);
        }
        let report = ReconciliationReport {
            scope: scope.clone(),
            generated_at: Utc::now(),
            entries,
        };
        for drift in report.drift_errors() {
            warn!(error = %drift, "aggregate drift");
        }
        info!(
            keys = report.entries.len(),
            drifted = report.drift_count(),
            purge_eligible = report.purge_eligible_count(),
            "reconciliation report ready"
        );
        Ok(report)
    }

    /// Recompute every drifted key in scope.
    pub fn correct_drift(&self, scope: &Scope) -> Result<Vec<AggregateSnapshot>, LedgerError> {
        let mut corrected = Vec::new();
        for key in self.keys_in(scope)? {
            if let Some(snapshot) = self.cache.correct(&key)? {
                corrected.push(snapshot);
            }
        }
        Ok(corrected)
    }

    /// Physically remove purge-eligible units in `scope`.
    ///
    /// `DryRun` reports what would happen. `Apply` holds the maintenance lock;
    /// a concurrent purge gets `AlreadyProcessing`.
    #[instrument(skip(self), fields(scope = %scope, mode = ?mode))]
    pub fn purge(
        &self,
        scope: &Scope,
        mode: RunMode,
        processed_by: &str,
    ) -> Result<PurgeReport, LedgerError> {
        if processed_by.trim().is_empty() {
            return Err(LedgerError::Validation("processed_by cannot be empty".into()));
        }
        let _lease = match mode {
            RunMode::Apply => Some(self.locks.acquire(PURGE_LOCK)?),
            RunMode::DryRun => None,
        };
        if mode == RunMode::Apply && *scope == Scope::All {
            warn!("full-system purge; run inside a maintenance window");
        }

        let analysis = self.reconcile(scope)?;
        let mut report = PurgeReport {
            mode,
            scope: scope.clone(),
            generated_at: Utc::now(),
            purged: Vec::new(),
            skipped: Vec::new(),
            drifted: analysis
                .entries
                .iter()
                .filter(|e| e.drifted())
                .map(|e| e.key.clone())
                .collect(),
            aggregates: Vec::new(),
        };

        for entry in &analysis.entries {
            for unit_id in &entry.blocked {
                report.skipped.push(SkippedUnit {
                    unit_id: *unit_id,
                    reason: "soft-deleted unit is still user-owned".into(),
                });
            }
            for unit_id in &entry.purge_eligible {
                match mode {
                    RunMode::DryRun => report.purged.push(PurgedEntry {
                        unit_id: *unit_id,
                        key: entry.key.clone(),
                        transfer_id: None,
                    }),
                    RunMode::Apply => match self.purge_unit(*unit_id, processed_by)? {
                        Ok(purged) => report.purged.push(purged),
                        Err(skipped) => report.skipped.push(skipped),
                    },
                }
            }
        }

        if mode == RunMode::Apply {
            for entry in &analysis.entries {
                let snapshot = match self.cache.correct(&entry.key)? {
                    Some(corrected) => corrected,
                    None => self.cache.recompute(&entry.key)?,
                };
                report.aggregates.push(snapshot);
            }
        }

        info!(
            purged = report.purged.len(),
            skipped = report.skipped.len(),
            drifted = report.drifted.len(),
            "purge finished"
        );
        Ok(report)
    }

    /// Units that block (or would be affected by) deleting `key`.
    pub fn deletion_eligibility(&self, key: &ItemKey) -> Result<DeletionEligibility, LedgerError> {
        let units = self.units.list_by_key(key)?;
        let mut eligibility = DeletionEligibility {
            key: key.clone(),
            admin_units: Vec::new(),
            user_owned: Vec::new(),
        };
        for unit in units.iter().filter(|u| !u.is_deleted()) {
            if unit.is_admin_stock() {
                eligibility.admin_units.push(unit.id_typed());
            } else {
                eligibility.user_owned.push(unit.id_typed());
            }
        }
        Ok(eligibility)
    }

    fn keys_in(&self, scope: &Scope) -> Result<Vec<ItemKey>, LedgerError> {
        match scope {
            Scope::Key { key } => Ok(vec![key.clone()]),
            Scope::All => {
                // Orphan rows with no units left are drift too.
                let mut keys: BTreeSet<ItemKey> = self.units.keys()?.into_iter().collect();
                keys.extend(self.cache.list()?.into_iter().map(|m| m.key));
                Ok(keys.into_iter().collect())
            }
        }
    }

    fn inspect(&self, key: &ItemKey) -> Result<KeyReport, LedgerError> {
        let units = self.units.list_by_key(key)?;
        let counts = derive_counts(key, &units, self.cache.rule());
        let mut report = KeyReport {
            key: key.clone(),
            stored: self.cache.get(key)?.map(|m| m.counts),
            recomputed: (!counts.is_empty()).then_some(counts),
            naive_row_count: units.len() as u64,
            soft_deleted: Vec::new(),
            purge_eligible: Vec::new(),
            blocked: Vec::new(),
        };
        for unit in units.iter().filter(|u| u.is_deleted()) {
            report.soft_deleted.push(unit.id_typed());
            if unit.is_purge_eligible() {
                report.purge_eligible.push(unit.id_typed());
            } else {
                report.blocked.push(unit.id_typed());
            }
        }
        Ok(report)
    }

    /// Outer error aborts the run; inner error skips this unit.
    fn purge_unit(
        &self,
        unit_id: UnitId,
        processed_by: &str,
    ) -> Result<Result<PurgedEntry, SkippedUnit>, LedgerError> {
        let skip = |reason: &str| SkippedUnit {
            unit_id,
            reason: reason.to_string(),
        };
        let Some(unit) = self.units.get(unit_id)? else {
            return Ok(Err(skip("unit no longer exists")));
        };
        if !unit.is_purge_eligible() {
            return Ok(Err(skip("unit is no longer soft-deleted admin stock")));
        }
        let version = unit.version();
        let key = unit.key().clone();

        // A previous run may have written the audit record and died before the delete.
        let record = match self
            .ledger
            .latest_for_unit(unit_id)?
            .filter(|r| r.transfer_type == TransferType::BulkAdminRemoval)
        {
            Some(existing) => existing,
            None => {
                let purged = unit.purge(Utc::now())?;
                let record = TransferRecord::removal(&purged, processed_by, PURGE_REASON)?;
                self.ledger.append(record.clone())?;
                record
            }
        };

        match self
            .units
            .delete_purged(unit_id, ExpectedVersion::Exact(version))
        {
            Ok(()) => {}
            Err(StoreError::VersionConflict(msg)) => {
                return Ok(Err(skip(&format!("unit changed during purge: {msg}"))));
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            unit_id = %unit_id,
            transfer_id = %record.id,
            item_type = key.item_type(),
            category_id = %key.category_id(),
            "unit purged"
        );
        self.notifier.publish(LedgerEvent::UnitPurged {
            unit_id,
            key: key.clone(),
            transfer_id: record.id,
            occurred_at: record.occurred_at,
        });
        Ok(Ok(PurgedEntry {
            unit_id,
            key,
            transfer_id: Some(record.id),
        }))
    }
}
