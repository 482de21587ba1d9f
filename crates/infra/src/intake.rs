//! Admin intake boundary: unit creation, attribute edits and deletion.
//!
//! Every mutation ends with an aggregate recomputation. Deletions go through
//! the reconciliation job's eligibility check, so user-owned units are never
//! deleted.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use equiptrack_core::{AggregateRoot, ConditionId, ExpectedVersion, StatusId, UnitId, UserId};
use equiptrack_inventory::{InventoryItem, ItemKey, NewUnit};

use crate::aggregate_cache::{AggregateCache, AggregateSnapshot};
use crate::error::LedgerError;
use crate::reconciliation::ReconciliationJob;
use crate::store::{StoreError, UnitStore};

const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub unit: InventoryItem,
    pub aggregate: AggregateSnapshot,
}

/// Which units an item-type deletion may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionScope {
    /// Delete admin stock, leave user-held units alone.
    AdminStockOnly,
    /// Delete every unit; rejected while any unit is user-owned.
    AllUnits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemTypeDeletion {
    pub key: ItemKey,
    pub soft_deleted: Vec<UnitId>,
    pub retained_user_owned: Vec<UnitId>,
    pub aggregate: AggregateSnapshot,
}

pub struct UnitIntake {
    units: Arc<dyn UnitStore>,
    cache: Arc<AggregateCache>,
    reconciliation: Arc<ReconciliationJob>,
}

impl UnitIntake {
    pub fn new(
        units: Arc<dyn UnitStore>,
        cache: Arc<AggregateCache>,
        reconciliation: Arc<ReconciliationJob>,
    ) -> Self {
        Self {
            units,
            cache,
            reconciliation,
        }
    }

    /// Admin-added unit, starting in admin stock.
    pub fn create_unit(&self, new: NewUnit, created_by: &str) -> Result<IntakeOutcome, LedgerError> {
        self.ensure_identifier_free(&new)?;
        let unit = InventoryItem::admin_intake(UnitId::new(), new, created_by, Utc::now())?;
        self.insert(unit)
    }

    /// Unit a user reports already holding.
    pub fn report_user_unit(&self, new: NewUnit, user: UserId) -> Result<IntakeOutcome, LedgerError> {
        self.ensure_identifier_free(&new)?;
        let unit = InventoryItem::user_reported(UnitId::new(), new, user, Utc::now())?;
        self.insert(unit)
    }

    pub fn set_status(&self, unit_id: UnitId, status: StatusId) -> Result<IntakeOutcome, LedgerError> {
        let unit = self.modify(unit_id, |u| {
            if u.status_id() == &status {
                return Ok(false);
            }
            u.set_status(status.clone())?;
            Ok(true)
        })?;
        self.finish(unit)
    }

    pub fn set_condition(
        &self,
        unit_id: UnitId,
        condition: ConditionId,
    ) -> Result<IntakeOutcome, LedgerError> {
        let unit = self.modify(unit_id, |u| {
            if u.condition_id() == &condition {
                return Ok(false);
            }
            u.set_condition(condition.clone())?;
            Ok(true)
        })?;
        self.finish(unit)
    }

    /// Soft-delete one unit. A user-owned unit yields `DeletionBlocked`.
    pub fn soft_delete_unit(
        &self,
        unit_id: UnitId,
        reason: &str,
        deleted_by: &str,
    ) -> Result<IntakeOutcome, LedgerError> {
        let unit = self.modify(unit_id, |u| {
            if !u.is_deleted() && !u.is_admin_stock() {
                return Err(LedgerError::DeletionBlocked {
                    subject: format!("unit {unit_id}"),
                    count: 1,
                    unit_ids: vec![unit_id],
                });
            }
            Ok(u.soft_delete(reason, deleted_by, Utc::now())?)
        })?;
        info!(unit_id = %unit_id, deleted_by, "unit soft-deleted");
        self.finish(unit)
    }

    /// Soft-delete the units of an item key.
    ///
    /// With `AllUnits`, any user-owned unit rejects the whole request before
    /// anything is written.
    pub fn delete_item_type(
        &self,
        key: &ItemKey,
        scope: DeletionScope,
        reason: &str,
        deleted_by: &str,
    ) -> Result<ItemTypeDeletion, LedgerError> {
        let eligibility = self.reconciliation.deletion_eligibility(key)?;
        if scope == DeletionScope::AllUnits {
            eligibility.ensure_deletable()?;
        }

        let mut soft_deleted = Vec::new();
        let mut retained_user_owned = eligibility.user_owned.clone();
        for unit_id in &eligibility.admin_units {
            let outcome = self.modify(*unit_id, |u| {
                if !u.is_admin_stock() {
                    return Ok(false);
                }
                Ok(u.soft_delete(reason, deleted_by, Utc::now())?)
            });
            match outcome {
                Ok(unit) if unit.is_deleted() => soft_deleted.push(*unit_id),
                // Issued to a user after the eligibility check.
                Ok(_) => retained_user_owned.push(*unit_id),
                Err(LedgerError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let aggregate = self.cache.recompute(key)?;
        info!(
            item_type = key.item_type(),
            category_id = %key.category_id(),
            deleted = soft_deleted.len(),
            retained = retained_user_owned.len(),
            deleted_by,
            "item type deleted"
        );
        if scope == DeletionScope::AllUnits && !retained_user_owned.is_empty() {
            return Err(LedgerError::DeletionBlocked {
                subject: key.to_string(),
                count: retained_user_owned.len(),
                unit_ids: retained_user_owned,
            });
        }
        Ok(ItemTypeDeletion {
            key: key.clone(),
            soft_deleted,
            retained_user_owned,
            aggregate,
        })
    }

    fn ensure_identifier_free(&self, new: &NewUnit) -> Result<(), LedgerError> {
        let Some(identifier) = &new.identifier else {
            return Ok(());
        };
        let taken = self
            .units
            .list_by_key(&new.key)?
            .iter()
            .filter(|u| !u.is_deleted())
            .any(|u| u.identifier().is_some_and(|id| id.matches(identifier.value())));
        if taken {
            return Err(LedgerError::Conflict(format!(
                "{identifier} is already registered for {}",
                new.key
            )));
        }
        Ok(())
    }

    fn insert(&self, unit: InventoryItem) -> Result<IntakeOutcome, LedgerError> {
        let unit = self.units.insert(unit)?;
        info!(
            unit_id = %unit.id_typed(),
            item_type = unit.item_type(),
            category_id = %unit.category_id(),
            owner = %unit.owner(),
            "unit registered"
        );
        self.finish(unit)
    }

    fn finish(&self, unit: InventoryItem) -> Result<IntakeOutcome, LedgerError> {
        let aggregate = self.cache.recompute(unit.key())?;
        Ok(IntakeOutcome { unit, aggregate })
    }

    /// Read-modify-write with compare-and-set. `change` returns whether it
    /// modified the unit.
    fn modify(
        &self,
        unit_id: UnitId,
        mut change: impl FnMut(&mut InventoryItem) -> Result<bool, LedgerError>,
    ) -> Result<InventoryItem, LedgerError> {
        for _ in 0..CAS_ATTEMPTS {
            let mut unit = self
                .units
                .get(unit_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("unit {unit_id}")))?;
            let version = unit.version();
            if !change(&mut unit)? {
                return Ok(unit);
            }
            match self.units.update(unit, ExpectedVersion::Exact(version)) {
                Ok(written) => return Ok(written),
                Err(StoreError::VersionConflict(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(LedgerError::Conflict(format!(
            "unit {unit_id} kept changing; try again"
        )))
    }
}
