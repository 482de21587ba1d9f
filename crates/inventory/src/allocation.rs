//! Unit selection for a request of N units of one item key.
//!
//! Selection is read-only: it picks units, the caller transfers them one by one.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use equiptrack_core::{AggregateRoot, UnitId};

use crate::unit::{Identifier, InventoryItem, ItemKey, ReadinessRule};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub key: ItemKey,
    pub quantity: u64,
    /// Specific serial/phone numbers the caller asked for.
    pub identifiers: Vec<String>,
}

/// A selected unit, pinned to the version that was inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub unit_id: UnitId,
    pub identifier: Option<Identifier>,
    pub version: u64,
}

impl UnitRef {
    fn of(unit: &InventoryItem) -> Self {
        Self {
            unit_id: unit.id_typed(),
            identifier: unit.identifier().cloned(),
            version: unit.version(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("insufficient stock for {key}: requested {requested}, available {available}")]
    InsufficientStock {
        key: ItemKey,
        requested: u64,
        available: u64,
    },

    #[error("requested identifiers not available in admin stock: {}", identifiers.join(", "))]
    IdentifierUnavailable { identifiers: Vec<String> },

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),
}

/// Choose which ready units fulfil `request`.
///
/// - Named identifiers must each match a ready unit; missing ones are reported,
///   never substituted.
/// - The remainder is filled with identified units first, then identifier-less
///   ones, oldest intake first.
pub fn select_units(
    candidates: &[InventoryItem],
    request: &AllocationRequest,
    rule: &ReadinessRule,
) -> Result<Vec<UnitRef>, AllocationError> {
    if request.quantity == 0 {
        return Err(AllocationError::InvalidRequest(
            "quantity must be at least 1".to_string(),
        ));
    }
    if request.identifiers.len() as u64 > request.quantity {
        return Err(AllocationError::InvalidRequest(format!(
            "{} identifiers named for a quantity of {}",
            request.identifiers.len(),
            request.quantity
        )));
    }

    let mut seen = HashSet::new();
    for wanted in &request.identifiers {
        let normalized = wanted.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(AllocationError::InvalidRequest(
                "identifier cannot be empty".to_string(),
            ));
        }
        if !seen.insert(normalized) {
            return Err(AllocationError::InvalidRequest(format!(
                "identifier {wanted} named twice"
            )));
        }
    }

    let mut ready: Vec<&InventoryItem> = candidates
        .iter()
        .filter(|u| u.key() == &request.key && u.is_ready(rule))
        .collect();
    ready.sort_by_key(|u| (u.provenance().created_at, u.id_typed()));

    let mut picked: Vec<&InventoryItem> = Vec::with_capacity(request.identifiers.len());
    let mut missing = Vec::new();
    for wanted in &request.identifiers {
        let hit = ready.iter().copied().find(|u| {
            u.identifier().is_some_and(|id| id.matches(wanted))
                && !picked.iter().any(|p| p.id_typed() == u.id_typed())
        });
        match hit {
            Some(unit) => picked.push(unit),
            None => missing.push(wanted.trim().to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(AllocationError::IdentifierUnavailable {
            identifiers: missing,
        });
    }

    let available = ready.len() as u64;
    if available < request.quantity {
        return Err(AllocationError::InsufficientStock {
            key: request.key.clone(),
            requested: request.quantity,
            available,
        });
    }

    // `quantity <= ready.len()` here, so it fits in usize.
    let remainder = request.quantity as usize - picked.len();
    let (identified, anonymous): (Vec<&InventoryItem>, Vec<&InventoryItem>) = ready
        .into_iter()
        .filter(|u| !picked.iter().any(|p| p.id_typed() == u.id_typed()))
        .partition(|u| u.identifier().is_some());
    picked.extend(identified.into_iter().chain(anonymous).take(remainder));

    Ok(picked.into_iter().map(UnitRef::of).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{NewUnit, Owner};
    use chrono::{Duration, Utc};
    use equiptrack_core::{CategoryId, ConditionId, StatusId, UserId};
    use proptest::prelude::*;

    fn key() -> ItemKey {
        ItemKey::new("Dell01", CategoryId::parse("laptops").unwrap()).unwrap()
    }

    fn rule() -> ReadinessRule {
        ReadinessRule::new(
            StatusId::parse("available").unwrap(),
            ConditionId::parse("working").unwrap(),
        )
    }

    fn unit(serial: Option<&str>, age_minutes: i64) -> InventoryItem {
        InventoryItem::admin_intake(
            UnitId::new(),
            NewUnit {
                key: key(),
                identifier: serial.map(|s| Identifier::serial(s).unwrap()),
                status_id: StatusId::parse("available").unwrap(),
                condition_id: ConditionId::parse("working").unwrap(),
            },
            "admin",
            Utc::now() - Duration::minutes(age_minutes),
        )
        .unwrap()
    }

    fn request(quantity: u64, identifiers: &[&str]) -> AllocationRequest {
        AllocationRequest {
            key: key(),
            quantity,
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn named_identifiers_are_selected_exactly() {
        let units = vec![unit(Some("A"), 3), unit(Some("B"), 2), unit(Some("C"), 1)];
        let picked = select_units(&units, &request(2, &["C", "a"]), &rule()).unwrap();
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].unit_id, units[2].id_typed());
        assert_eq!(picked[1].unit_id, units[0].id_typed());
    }

    #[test]
    fn missing_identifier_is_reported_not_substituted() {
        let mut units = vec![unit(Some("A"), 3), unit(Some("B"), 2), unit(Some("C"), 1)];
        units[1]
            .reassign(
                &Owner::AdminStock,
                Owner::user(UserId::parse("alice").unwrap()),
                Utc::now(),
            )
            .unwrap();

        let err = select_units(&units, &request(2, &["A", "B"]), &rule()).unwrap_err();
        assert_eq!(
            err,
            AllocationError::IdentifierUnavailable {
                identifiers: vec!["B".to_string()]
            }
        );
    }

    #[test]
    fn remainder_prefers_identified_units() {
        let units = vec![unit(None, 10), unit(None, 9), unit(Some("X"), 1), unit(Some("Y"), 2)];
        let picked = select_units(&units, &request(3, &[]), &rule()).unwrap();
        let ids: Vec<_> = picked.iter().map(|r| r.unit_id).collect();
        assert_eq!(
            ids,
            vec![units[3].id_typed(), units[2].id_typed(), units[0].id_typed()]
        );
    }

    #[test]
    fn named_plus_remainder() {
        let units = vec![unit(None, 5), unit(Some("X"), 4), unit(Some("Y"), 3)];
        let picked = select_units(&units, &request(2, &["Y"]), &rule()).unwrap();
        assert_eq!(picked[0].unit_id, units[2].id_typed());
        assert_eq!(picked[1].unit_id, units[1].id_typed());
    }

    #[test]
    fn damaged_and_deleted_units_are_not_selectable() {
        let mut units = vec![unit(None, 3), unit(None, 2), unit(None, 1)];
        units[0]
            .set_condition(ConditionId::parse("damaged").unwrap())
            .unwrap();
        units[1].soft_delete("retired", "admin", Utc::now()).unwrap();

        let err = select_units(&units, &request(2, &[]), &rule()).unwrap_err();
        assert_eq!(
            err,
            AllocationError::InsufficientStock {
                key: key(),
                requested: 2,
                available: 1
            }
        );
    }

    #[test]
    fn absurd_quantity_is_insufficient_stock() {
        let units = vec![unit(Some("A"), 1)];
        let err = select_units(&units, &request(u64::MAX, &[]), &rule()).unwrap_err();
        assert_eq!(
            err,
            AllocationError::InsufficientStock {
                key: key(),
                requested: u64::MAX,
                available: 1
            }
        );
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let units = vec![unit(Some("A"), 1)];
        assert!(matches!(
            select_units(&units, &request(0, &[]), &rule()),
            Err(AllocationError::InvalidRequest(_))
        ));
        assert!(matches!(
            select_units(&units, &request(1, &["A", "B"]), &rule()),
            Err(AllocationError::InvalidRequest(_))
        ));
        assert!(matches!(
            select_units(&units, &request(2, &["A", "a"]), &rule()),
            Err(AllocationError::InvalidRequest(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: a successful selection returns exactly `quantity` distinct,
        /// ready units of the requested key.
        #[test]
        fn selection_is_distinct_and_ready(
            identified in prop::collection::vec(any::<bool>(), 1..20),
            quantity in 1u64..25,
        ) {
            let units: Vec<_> = identified
                .iter()
                .enumerate()
                .map(|(i, has_serial)| {
                    let serial = format!("SN-{i}");
                    unit(has_serial.then_some(serial.as_str()), i as i64)
                })
                .collect();

            match select_units(&units, &request(quantity, &[]), &rule()) {
                Ok(picked) => {
                    prop_assert_eq!(picked.len() as u64, quantity);
                    let distinct: HashSet<_> = picked.iter().map(|r| r.unit_id).collect();
                    prop_assert_eq!(distinct.len(), picked.len());
                }
                Err(AllocationError::InsufficientStock { available, .. }) => {
                    prop_assert!(available < quantity);
                    prop_assert_eq!(available, units.len() as u64);
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }
}
