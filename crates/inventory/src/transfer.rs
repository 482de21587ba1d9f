use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use equiptrack_core::{DomainError, DomainResult, TransferId, UnitId};

use crate::unit::{Identifier, InventoryItem, ItemKey, Owner, PurgedUnit};

/// Why a unit changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    /// Admin approved a user's request; unit leaves admin stock.
    RequestApproved,
    /// Admin accepted a user's return; unit goes back to admin stock.
    ReturnCompleted,
    /// Admin moved a unit directly between owners.
    AdminReassignment,
    /// Reconciliation purged a soft-deleted unit from the system.
    BulkAdminRemoval,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::RequestApproved => "request_approved",
            TransferType::ReturnCompleted => "return_completed",
            TransferType::AdminReassignment => "admin_reassignment",
            TransferType::BulkAdminRemoval => "bulk_admin_removal",
        }
    }
}

/// One immutable entry in the Transfer Ledger (`TransferLog`).
///
/// `to == None` means the unit left the system (purge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub unit_id: UnitId,
    pub key: ItemKey,
    pub identifier: Option<Identifier>,
    pub transfer_type: TransferType,
    pub from: Owner,
    pub to: Option<Owner>,
    pub occurred_at: DateTime<Utc>,
    pub processed_by: String,
    pub reason: String,
    /// Never moved to cold storage by archival sweeps.
    pub retain_forever: bool,
    /// Appended by a retry that found the ownership write without its record.
    pub recovered: bool,
}

impl TransferRecord {
    /// Record an ownership change of `unit` from `from` to `to`.
    pub fn ownership_change(
        unit: &InventoryItem,
        transfer_type: TransferType,
        from: Owner,
        to: Owner,
        processed_by: impl Into<String>,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if transfer_type == TransferType::BulkAdminRemoval {
            return Err(DomainError::validation(
                "bulk removal records are created from purged units",
            ));
        }
        if from == to {
            return Err(DomainError::validation("from and to owners are identical"));
        }
        Ok(Self {
            id: TransferId::new(),
            unit_id: unit.id_typed(),
            key: unit.key().clone(),
            identifier: unit.identifier().cloned(),
            transfer_type,
            from,
            to: Some(to),
            occurred_at: at,
            processed_by: non_blank(processed_by.into(), "processed_by")?,
            reason: reason.into(),
            retain_forever: false,
            recovered: false,
        })
    }

    /// Permanent audit entry for a purged unit.
    pub fn removal(
        purged: &PurgedUnit,
        processed_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> DomainResult<Self> {
        let unit = purged.unit();
        Ok(Self {
            id: TransferId::new(),
            unit_id: unit.id_typed(),
            key: unit.key().clone(),
            identifier: unit.identifier().cloned(),
            transfer_type: TransferType::BulkAdminRemoval,
            from: unit.owner().clone(),
            to: None,
            occurred_at: purged.purged_at(),
            processed_by: non_blank(processed_by.into(), "processed_by")?,
            reason: reason.into(),
            retain_forever: true,
            recovered: false,
        })
    }

    pub fn mark_recovered(mut self) -> Self {
        self.recovered = true;
        self
    }

    /// Whether this record explains `owner` as the unit's current holder.
    pub fn lands_on(&self, owner: &Owner) -> bool {
        self.to.as_ref() == Some(owner)
    }
}

fn non_blank(value: String, what: &str) -> DomainResult<String> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{what} cannot be empty")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::NewUnit;
    use equiptrack_core::{CategoryId, ConditionId, StatusId, UserId};

    fn unit() -> InventoryItem {
        InventoryItem::admin_intake(
            UnitId::new(),
            NewUnit {
                key: ItemKey::new("Dell01", CategoryId::parse("laptops").unwrap()).unwrap(),
                identifier: Some(Identifier::serial("SN-9").unwrap()),
                status_id: StatusId::parse("available").unwrap(),
                condition_id: ConditionId::parse("working").unwrap(),
            },
            "admin",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn ownership_change_captures_unit_identity() {
        let u = unit();
        let alice = Owner::user(UserId::parse("alice").unwrap());
        let rec = TransferRecord::ownership_change(
            &u,
            TransferType::RequestApproved,
            Owner::AdminStock,
            alice.clone(),
            "admin-1",
            "request #12 approved",
            Utc::now(),
        )
        .unwrap();

        assert_eq!(rec.unit_id, u.id_typed());
        assert_eq!(rec.identifier, u.identifier().cloned());
        assert!(rec.lands_on(&alice));
        assert!(!rec.retain_forever);
    }

    #[test]
    fn ownership_change_rejects_blank_actor_and_noop() {
        let u = unit();
        let no_actor = TransferRecord::ownership_change(
            &u,
            TransferType::AdminReassignment,
            Owner::AdminStock,
            Owner::user(UserId::parse("bob").unwrap()),
            "  ",
            "",
            Utc::now(),
        );
        assert!(no_actor.is_err());

        let noop = TransferRecord::ownership_change(
            &u,
            TransferType::AdminReassignment,
            Owner::AdminStock,
            Owner::AdminStock,
            "admin",
            "",
            Utc::now(),
        );
        assert!(noop.is_err());
    }

    #[test]
    fn removal_record_is_retained_forever() {
        let mut u = unit();
        u.soft_delete("retired", "admin", Utc::now()).unwrap();
        let purged = u.purge(Utc::now()).unwrap();

        let rec = TransferRecord::removal(&purged, "reconciler", "purge").unwrap();
        assert_eq!(rec.transfer_type, TransferType::BulkAdminRemoval);
        assert_eq!(rec.to, None);
        assert!(rec.retain_forever);
    }
}
