//! Allocation Selector: picks which ready units fulfil a request.
//!
//! Selection reads units only. The stored aggregate is a cross-check: a
//! disagreement is logged and left for reconciliation to correct.

use std::sync::Arc;

use tracing::{debug, warn};

use equiptrack_inventory::{AllocationRequest, ItemKey, UnitRef, select_units};

use crate::aggregate_cache::AggregateCache;
use crate::error::LedgerError;
use crate::store::UnitStore;

pub struct AllocationSelector {
    units: Arc<dyn UnitStore>,
    cache: Arc<AggregateCache>,
}

impl AllocationSelector {
    pub fn new(units: Arc<dyn UnitStore>, cache: Arc<AggregateCache>) -> Self {
        Self { units, cache }
    }

    /// Choose `quantity` ready units of `key`, honoring named identifiers.
    ///
    /// Named identifiers that are not ready in admin stock fail with
    /// `IdentifierUnavailable`; they are never swapped for another unit.
    pub fn select_units(
        &self,
        key: &ItemKey,
        quantity: u64,
        identifiers: &[String],
    ) -> Result<Vec<UnitRef>, LedgerError> {
        let candidates = self.units.list_by_key(key)?;
        let rule = self.cache.rule();

        let ready = candidates.iter().filter(|u| u.is_ready(rule)).count() as u64;
        let stored = self
            .cache
            .get(key)?
            .map_or(0, |m| m.counts.available_quantity);
        if stored != ready {
            warn!(
                item_type = key.item_type(),
                category_id = %key.category_id(),
                stored,
                scanned = ready,
                "available count disagrees with unit scan"
            );
        }

        let request = AllocationRequest {
            key: key.clone(),
            quantity,
            identifiers: identifiers.to_vec(),
        };
        let picked = select_units(&candidates, &request, rule)?;
        debug!(
            item_type = key.item_type(),
            category_id = %key.category_id(),
            quantity,
            named = identifiers.len(),
            "units selected"
        );
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use equiptrack_core::{CategoryId, ConditionId, StatusId, UnitId};
    use equiptrack_inventory::{
        AggregateCounts, Identifier, InventoryItem, InventoryMaster, NewUnit, ReadinessRule,
    };

    use crate::notify::Notifier;
    use crate::store::{AggregateStore, InMemoryAggregateStore, InMemoryUnitStore};

    fn key() -> ItemKey {
        ItemKey::new("Dell01", CategoryId::parse("laptops").unwrap()).unwrap()
    }

    fn setup(serials: &[&str]) -> (Arc<InMemoryAggregateStore>, AllocationSelector) {
        let units = Arc::new(InMemoryUnitStore::new());
        let masters = Arc::new(InMemoryAggregateStore::new());
        for serial in serials {
            units
                .insert(
                    InventoryItem::admin_intake(
                        UnitId::new(),
                        NewUnit {
                            key: key(),
                            identifier: Some(Identifier::serial(*serial).unwrap()),
                            status_id: StatusId::parse("available").unwrap(),
                            condition_id: ConditionId::parse("working").unwrap(),
                        },
                        "admin",
                        Utc::now(),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        let cache = Arc::new(AggregateCache::new(
            units.clone(),
            masters.clone(),
            ReadinessRule::new(
                StatusId::parse("available").unwrap(),
                ConditionId::parse("working").unwrap(),
            ),
            Notifier::disabled(),
        ));
        cache.recompute(&key()).unwrap();
        (masters, AllocationSelector::new(units, cache))
    }

    #[test]
    fn selects_named_units() {
        let (_, selector) = setup(&["A", "B", "C"]);
        let picked = selector
            .select_units(&key(), 1, &["b".to_string()])
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].identifier.as_ref().unwrap().value(), "B");
    }

    #[test]
    fn insufficient_stock_carries_counts() {
        let (_, selector) = setup(&["A"]);
        let err = selector.select_units(&key(), 2, &[]).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                key: key(),
                requested: 2,
                available: 1
            }
        );
    }

    #[test]
    fn selection_trusts_the_scan_and_leaves_the_row_alone() {
        let (masters, selector) = setup(&["A", "B"]);
        let stale = AggregateCounts {
            total_quantity: 9,
            available_quantity: 9,
            user_owned_quantity: 0,
        };
        masters
            .upsert(InventoryMaster::new(key(), stale, Utc::now()))
            .unwrap();

        assert_eq!(selector.select_units(&key(), 2, &[]).unwrap().len(), 2);
        let err = selector.select_units(&key(), 3, &[]).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientStock { available: 2, .. }
        ));

        let row = masters.get(&key()).unwrap().unwrap();
        assert_eq!(row.counts, stale);
    }
}
