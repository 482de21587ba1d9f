//! Derived per-(item-type, category) rollup (`InventoryMaster`).
//!
//! The rollup is a cache over the unit collection. It is only ever produced by
//! [`derive_counts`] over a full scan; nothing increments or decrements it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::unit::{InventoryItem, ItemKey, ReadinessRule};

/// Counters derived from the units of one item key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateCounts {
    /// All non-deleted units, ready or not, admin or user owned.
    pub total_quantity: u64,
    /// Issuable admin-stock units (ready status and condition).
    pub available_quantity: u64,
    /// Units currently held by users.
    pub user_owned_quantity: u64,
}

impl AggregateCounts {
    /// Non-deleted admin-stock units regardless of readiness.
    ///
    /// Saturates at zero for an inconsistent (drifted) stored row.
    pub fn admin_stock_quantity(&self) -> u64 {
        self.total_quantity.saturating_sub(self.user_owned_quantity)
    }

    pub fn is_empty(&self) -> bool {
        self.total_quantity == 0
    }
}

/// Full re-derivation of the counters from a unit scan.
///
/// Soft-deleted units are skipped. Units whose key differs from `key` are
/// ignored so callers can pass an unfiltered iterator.
pub fn derive_counts<'a>(
    key: &ItemKey,
    units: impl IntoIterator<Item = &'a InventoryItem>,
    rule: &ReadinessRule,
) -> AggregateCounts {
    let mut counts = AggregateCounts::default();
    for unit in units {
        if unit.key() != key || unit.is_deleted() {
            continue;
        }
        counts.total_quantity += 1;
        if unit.is_admin_stock() {
            if unit.is_ready(rule) {
                counts.available_quantity += 1;
            }
        } else {
            counts.user_owned_quantity += 1;
        }
    }
    counts
}

/// Stored aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMaster {
    pub key: ItemKey,
    pub counts: AggregateCounts,
    pub recomputed_at: DateTime<Utc>,
}

impl InventoryMaster {
    pub fn new(key: ItemKey, counts: AggregateCounts, recomputed_at: DateTime<Utc>) -> Self {
        Self {
            key,
            counts,
            recomputed_at,
        }
    }

    pub fn total_quantity(&self) -> u64 {
        self.counts.total_quantity
    }

    pub fn available_quantity(&self) -> u64 {
        self.counts.available_quantity
    }

    pub fn user_owned_quantity(&self) -> u64 {
        self.counts.user_owned_quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Identifier, NewUnit, Owner};
    use equiptrack_core::{CategoryId, ConditionId, StatusId, UnitId, UserId};
    use proptest::prelude::*;

    fn key(name: &str) -> ItemKey {
        ItemKey::new(name, CategoryId::parse("laptops").unwrap()).unwrap()
    }

    fn rule() -> ReadinessRule {
        ReadinessRule::new(
            StatusId::parse("available").unwrap(),
            ConditionId::parse("working").unwrap(),
        )
    }

    fn unit(key: &ItemKey, condition: &str) -> InventoryItem {
        InventoryItem::admin_intake(
            UnitId::new(),
            NewUnit {
                key: key.clone(),
                identifier: None,
                status_id: StatusId::parse("available").unwrap(),
                condition_id: ConditionId::parse(condition).unwrap(),
            },
            "admin",
            Utc::now(),
        )
        .unwrap()
    }

    fn give_to_user(unit: &mut InventoryItem, user: &str) {
        unit.reassign(
            &Owner::AdminStock,
            Owner::user(UserId::parse(user).unwrap()),
            Utc::now(),
        )
        .unwrap();
    }

    #[test]
    fn counts_partition_by_ownership_and_readiness() {
        let k = key("Dell01");
        let mut units: Vec<_> = (0..4).map(|_| unit(&k, "working")).collect();
        units.push(unit(&k, "damaged"));
        give_to_user(&mut units[0], "alice");

        let counts = derive_counts(&k, &units, &rule());
        assert_eq!(counts.total_quantity, 5);
        assert_eq!(counts.available_quantity, 3);
        assert_eq!(counts.user_owned_quantity, 1);
        assert_eq!(counts.admin_stock_quantity(), 4);
    }

    #[test]
    fn drifted_row_does_not_underflow_admin_stock() {
        let drifted = AggregateCounts {
            total_quantity: 1,
            available_quantity: 0,
            user_owned_quantity: 3,
        };
        assert_eq!(drifted.admin_stock_quantity(), 0);
    }

    #[test]
    fn soft_deleted_and_foreign_units_are_excluded() {
        let k = key("Dell01");
        let other = key("Lenovo");
        let mut units = vec![unit(&k, "working"), unit(&k, "working"), unit(&other, "working")];
        units[1].soft_delete("retired", "admin", Utc::now()).unwrap();

        let counts = derive_counts(&k, &units, &rule());
        assert_eq!(counts.total_quantity, 1);
        assert_eq!(counts.available_quantity, 1);
    }

    #[test]
    fn identified_units_count_like_any_other() {
        let k = key("SIM");
        let u = InventoryItem::admin_intake(
            UnitId::new(),
            NewUnit {
                key: k.clone(),
                identifier: Some(Identifier::phone("+15550100").unwrap()),
                status_id: StatusId::parse("available").unwrap(),
                condition_id: ConditionId::parse("working").unwrap(),
            },
            "admin",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(derive_counts(&k, [&u], &rule()).available_quantity, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: total always equals admin-stock units plus user-owned units,
        /// and available never exceeds admin stock.
        #[test]
        fn total_is_admin_plus_user_owned(
            layout in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 0..40)
        ) {
            let k = key("Dell01");
            let mut units = Vec::new();
            for (user_owned, damaged, deleted) in layout {
                let mut u = unit(&k, if damaged { "damaged" } else { "working" });
                if deleted {
                    u.soft_delete("retired", "admin", Utc::now()).unwrap();
                } else if user_owned {
                    give_to_user(&mut u, "alice");
                }
                units.push(u);
            }

            let counts = derive_counts(&k, &units, &rule());
            let non_deleted = units.iter().filter(|u| !u.is_deleted()).count() as u64;
            let admin = units.iter().filter(|u| !u.is_deleted() && u.is_admin_stock()).count() as u64;

            prop_assert_eq!(counts.total_quantity, non_deleted);
            prop_assert_eq!(counts.total_quantity, admin + counts.user_owned_quantity);
            prop_assert!(counts.available_quantity <= admin);
        }
    }
}
